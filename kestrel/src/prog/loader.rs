//! Loader plug-in interface.
//!
//! A loader turns an on-disk binary into a [`Process`]. Loaders advertise
//! the (architecture, ABI) pairs they serve and the optional capabilities
//! they provide, so downstream passes can check availability before relying
//! on register usage or source lines.

use super::{Address, Inst, InstKind, Process, Segment, Symbol, SymbolKind};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Optional capabilities a loader may provide on top of the bare
/// instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderFeature {
    Instructions,
    Memory,
    Symbols,
    SourceLines,
    RegisterUsage,
    /// Semantic micro-ops per instruction, for value analyses.
    Semantics,
}

/// Free-form loader configuration passed through from the command line.
#[derive(Debug, Clone, Default)]
pub struct LoaderConfig {
    /// Preferred architecture, e.g. `"armv7"`.
    pub arch: Option<String>,
    /// Preferred ABI, e.g. `"eabi"`.
    pub abi: Option<String>,
}

pub trait Loader {
    fn name(&self) -> &str;

    /// (architecture, abi) pairs this loader serves.
    fn targets(&self) -> Vec<(String, String)>;

    fn features(&self) -> Vec<LoaderFeature>;

    /// Whether this loader recognizes the file format.
    fn accepts(&self, path: &Path) -> bool;

    fn load(&self, path: &Path, config: &LoaderConfig) -> Result<Process>;
}

/// Capability table over the registered loaders. Discovery walks the
/// registration order, so more specific loaders should register first.
#[derive(Default)]
pub struct LoaderRegistry {
    loaders: Vec<Box<dyn Loader>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in loaders available.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register(Box::new(ImageLoader));
        reg
    }

    pub fn register(&mut self, loader: Box<dyn Loader>) {
        self.loaders.push(loader);
    }

    /// Loader serving the given architecture/ABI pair.
    pub fn find(&self, arch: &str, abi: &str) -> Option<&dyn Loader> {
        self.loaders
            .iter()
            .find(|l| {
                l.targets()
                    .iter()
                    .any(|(a, b)| a == arch && (b == abi || b == "*"))
            })
            .map(|l| l.as_ref())
    }

    /// Load a binary with the first loader that accepts its format.
    pub fn load(&self, path: &Path, config: &LoaderConfig) -> Result<Process> {
        for loader in &self.loaders {
            if loader.accepts(path) {
                tracing::debug!(loader = loader.name(), path = %path.display(), "loading binary");
                return loader.load(path, config);
            }
        }
        Err(Error::Load {
            path: path.to_path_buf(),
            message: "no registered loader accepts this format".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Built-in image loader
// ---------------------------------------------------------------------------

/// TOML program-image description consumed by [`ImageLoader`].
#[derive(Debug, Deserialize)]
struct ImageDoc {
    name: Option<String>,
    entry: Address,
    #[serde(default)]
    segment: Vec<SegmentDoc>,
    #[serde(default)]
    inst: Vec<InstDoc>,
    #[serde(default)]
    symbol: Vec<SymbolDoc>,
}

#[derive(Debug, Deserialize)]
struct SegmentDoc {
    name: String,
    base: Address,
    #[serde(default)]
    data: Vec<u8>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default = "default_true")]
    executable: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct InstDoc {
    address: Address,
    #[serde(default = "default_inst_size")]
    size: u32,
    #[serde(default)]
    kind: Vec<String>,
    target: Option<Address>,
    reads: Option<Vec<u16>>,
    writes: Option<Vec<u16>>,
}

fn default_inst_size() -> u32 {
    4
}

#[derive(Debug, Deserialize)]
struct SymbolDoc {
    name: String,
    address: Address,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    function: bool,
}

fn parse_kind(names: &[String], path: &Path) -> Result<InstKind> {
    let mut kind = InstKind::NONE;
    for name in names {
        kind = kind
            | match name.as_str() {
                "control" => InstKind::CONTROL,
                "call" => InstKind::CALL,
                "return" => InstKind::RETURN,
                "load" => InstKind::LOAD,
                "store" => InstKind::STORE,
                "cond" => InstKind::COND,
                "multi" => InstKind::MULTI,
                "unknown" => InstKind::UNKNOWN,
                "bundle-end" => InstKind::BUNDLE_END,
                "alu" => InstKind::ALU,
                "mul" => InstKind::MUL,
                "float" => InstKind::FLOAT,
                other => {
                    return Err(Error::Load {
                        path: path.to_path_buf(),
                        message: format!("unknown instruction kind '{}'", other),
                    })
                }
            };
    }
    Ok(kind)
}

/// Loader for pre-decoded program images stored as TOML documents.
///
/// The format carries the entry point, segments (with literal bytes or a
/// zero-filled size), the decoded instruction table and the symbol table.
/// It is the reference loader used by the test suites and by workspace
/// reloading; real targets are served by external loader plug-ins.
pub struct ImageLoader;

impl Loader for ImageLoader {
    fn name(&self) -> &str {
        "image"
    }

    fn targets(&self) -> Vec<(String, String)> {
        vec![("image".into(), "*".into())]
    }

    fn features(&self) -> Vec<LoaderFeature> {
        vec![
            LoaderFeature::Instructions,
            LoaderFeature::Memory,
            LoaderFeature::Symbols,
            LoaderFeature::RegisterUsage,
        ]
    }

    fn accepts(&self, path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("toml") | Some("image")
        )
    }

    fn load(&self, path: &Path, _config: &LoaderConfig) -> Result<Process> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::Load {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let doc: ImageDoc = toml::from_str(&text).map_err(|e| Error::Load {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let name = doc.name.unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "task".into())
        });
        let mut builder = Process::builder(name).start(doc.entry);

        for seg in doc.segment {
            let data = if seg.data.is_empty() {
                vec![0; seg.size.unwrap_or(0) as usize]
            } else {
                seg.data
            };
            builder = builder.segment(Segment {
                name: seg.name,
                base: seg.base,
                data,
                executable: seg.executable,
            });
        }

        for idoc in doc.inst {
            let mut inst = Inst::new(idoc.address, idoc.size, parse_kind(&idoc.kind, path)?);
            if let Some(target) = idoc.target {
                inst = inst.with_target(target);
            }
            if let (Some(reads), Some(writes)) = (idoc.reads, idoc.writes) {
                inst = inst.with_regs(reads, writes);
            }
            builder = builder.inst(inst);
        }

        for sym in doc.symbol {
            builder = builder.symbol(Symbol {
                name: sym.name,
                address: sym.address,
                size: sym.size,
                kind: if sym.function {
                    SymbolKind::Function
                } else {
                    SymbolKind::Label
                },
            });
        }

        Ok(builder.build())
    }
}

//! Workspace persistence.
//!
//! A CFG collection can be saved to a directory (one JSON document per
//! CFG plus a manifest) and reloaded later, skipping reconstruction from
//! the binary. Saving and loading are a dedicated pair of passes; the
//! loader provides the same feature as the CFG builder, so registering it
//! first replaces reconstruction for the session.

use crate::cfg::{Block, BlockKind, Cfg, CfgCollection, CfgRef, EdgeKind};
use crate::driver::pass::{Context, Pass, CFG_FEATURE};
use crate::driver::WorkSpace;
use crate::error::{Error, Result};
use crate::prog::{Address, Inst};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize)]
struct DocBlock {
    kind: String,
    #[serde(default)]
    insts: Vec<Inst>,
    #[serde(default)]
    callee: Option<u32>,
    #[serde(default)]
    recursive: bool,
}

#[derive(Serialize, Deserialize)]
struct DocEdge {
    src: u32,
    dst: u32,
    kind: String,
}

#[derive(Serialize, Deserialize)]
struct DocCfg {
    name: String,
    address: Address,
    /// Blocks in node-index order; positions 0 and 1 are the sentinels.
    blocks: Vec<DocBlock>,
    edges: Vec<DocEdge>,
}

#[derive(Serialize, Deserialize)]
struct Manifest {
    task: String,
    entry: Address,
    cfgs: Vec<String>,
}

fn edge_kind_name(kind: EdgeKind) -> &'static str {
    match kind {
        EdgeKind::Taken => "taken",
        EdgeKind::NotTaken => "not-taken",
        EdgeKind::Call => "call",
        EdgeKind::Return => "return",
        EdgeKind::Virtual => "virtual",
    }
}

fn edge_kind_parse(name: &str) -> Result<EdgeKind> {
    match name {
        "taken" => Ok(EdgeKind::Taken),
        "not-taken" => Ok(EdgeKind::NotTaken),
        "call" => Ok(EdgeKind::Call),
        "return" => Ok(EdgeKind::Return),
        "virtual" => Ok(EdgeKind::Virtual),
        other => Err(Error::Config(format!("unknown edge kind '{}'", other))),
    }
}

/// Writes the collection under `dir`.
pub fn save(coll: &CfgCollection, task: &str, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut files = Vec::new();

    for (r, cfg) in coll.iter() {
        let blocks = cfg
            .blocks()
            .map(|n| {
                let block = cfg.block(n);
                match &block.kind {
                    BlockKind::Entry => DocBlock {
                        kind: "entry".into(),
                        insts: Vec::new(),
                        callee: None,
                        recursive: false,
                    },
                    BlockKind::Exit => DocBlock {
                        kind: "exit".into(),
                        insts: Vec::new(),
                        callee: None,
                        recursive: false,
                    },
                    BlockKind::Basic { insts } => DocBlock {
                        kind: "basic".into(),
                        insts: insts.clone(),
                        callee: None,
                        recursive: false,
                    },
                    BlockKind::Synth { callee, recursive } => DocBlock {
                        kind: "synth".into(),
                        insts: Vec::new(),
                        callee: callee.map(|c| c.0),
                        recursive: *recursive,
                    },
                }
            })
            .collect();

        let edges = cfg
            .graph
            .edge_indices()
            .map(|e| {
                let (src, dst) = cfg.endpoints(e);
                DocEdge {
                    src: src.index() as u32,
                    dst: dst.index() as u32,
                    kind: edge_kind_name(cfg.edge(e).kind).to_string(),
                }
            })
            .collect();

        let doc = DocCfg {
            name: cfg.name().to_string(),
            address: cfg.address(),
            blocks,
            edges,
        };
        let file = format!("cfg_{}.json", r.0);
        let json =
            serde_json::to_string_pretty(&doc).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(dir.join(&file), json)?;
        files.push(file);
    }

    let manifest = Manifest {
        task: task.to_string(),
        entry: coll.entry_cfg().address(),
        cfgs: files,
    };
    let json =
        serde_json::to_string_pretty(&manifest).map_err(|e| Error::Config(e.to_string()))?;
    std::fs::write(dir.join("manifest.json"), json)?;
    tracing::info!(dir = %dir.display(), cfgs = coll.len(), "workspace saved");
    Ok(())
}

/// Reloads a saved collection.
pub fn load(dir: &Path) -> Result<CfgCollection> {
    let manifest: Manifest = read_json(&dir.join("manifest.json"))?;
    let mut coll = CfgCollection::new();

    for file in &manifest.cfgs {
        let doc: DocCfg = read_json(&dir.join(file))?;
        let mut cfg = Cfg::new(&doc.name, doc.address);

        // sentinels sit at positions 0 and 1 by construction
        let mut nodes = vec![cfg.entry(), cfg.exit()];
        for (i, b) in doc.blocks.iter().enumerate() {
            match (i, b.kind.as_str()) {
                (0, "entry") | (1, "exit") => {}
                (_, "basic") => nodes.push(cfg.add_block(Block::basic(b.insts.clone()))),
                (_, "synth") => nodes.push(cfg.add_block(Block::synth(
                    b.callee.map(CfgRef),
                    b.recursive,
                ))),
                (i, other) => {
                    return Err(Error::Config(format!(
                        "{}: unexpected block kind '{}' at {}",
                        doc.name, other, i
                    )))
                }
            }
        }

        for e in &doc.edges {
            let src = *nodes.get(e.src as usize).ok_or_else(|| {
                Error::Config(format!("{}: edge source out of range", doc.name))
            })?;
            let dst = *nodes.get(e.dst as usize).ok_or_else(|| {
                Error::Config(format!("{}: edge target out of range", doc.name))
            })?;
            cfg.add_edge(src, dst, edge_kind_parse(&e.kind)?);
        }

        cfg.check().map_err(Error::Config)?;
        coll.add(cfg);
    }

    // rebuild the caller lists from the synthetic blocks
    let mut found = Vec::new();
    for (r, cfg) in coll.iter() {
        for n in cfg.blocks() {
            if let Some(callee) = cfg.block(n).callee() {
                found.push((callee, r, n));
            }
        }
    }
    for (callee, caller, site) in found {
        coll.get_mut(callee).callers.push((caller, site));
    }

    Ok(coll)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

/// Saving half of the I/O pass pair.
pub struct SaveWorkspace {
    pub dir: PathBuf,
}

impl Pass for SaveWorkspace {
    fn name(&self) -> &'static str {
        "workspace-saver"
    }

    fn provides(&self) -> &'static [&'static str] {
        &["workspace-saved"]
    }

    fn requires(&self) -> &'static [&'static str] {
        &[CFG_FEATURE]
    }

    fn run(&mut self, ws: &mut WorkSpace, _ctx: &mut Context) -> Result<()> {
        save(ws.collection(), ws.process.name(), &self.dir)
    }
}

/// Loading half: provides the CFG feature instead of the builder.
pub struct LoadWorkspace {
    pub dir: PathBuf,
}

impl Pass for LoadWorkspace {
    fn name(&self) -> &'static str {
        "workspace-loader"
    }

    fn provides(&self) -> &'static [&'static str] {
        &[CFG_FEATURE]
    }

    fn run(&mut self, ws: &mut WorkSpace, _ctx: &mut Context) -> Result<()> {
        ws.coll = Some(load(&self.dir)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::builder::CfgBuilder;
    use crate::prog::{InstKind, Process, Segment};

    fn sample() -> CfgCollection {
        let proc = Process::builder("t")
            .start(0x100)
            .segment(Segment {
                name: ".text".into(),
                base: 0x100,
                data: vec![0; 0x200],
                executable: true,
            })
            .insts(vec![
                Inst::new(0x100, 4, InstKind::CONTROL | InstKind::CALL).with_target(0x200),
                Inst::new(0x104, 4, InstKind::CONTROL | InstKind::COND).with_target(0x100),
                Inst::new(0x108, 4, InstKind::CONTROL | InstKind::RETURN),
                Inst::new(0x200, 4, InstKind::ALU),
                Inst::new(0x204, 4, InstKind::CONTROL | InstKind::RETURN),
            ])
            .build();
        CfgBuilder::new(&proc).build(0x100).unwrap()
    }

    #[test]
    fn test_save_load_roundtrip() {
        let coll = sample();
        let dir = tempfile::tempdir().unwrap();
        save(&coll, "t", dir.path()).unwrap();

        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.len(), coll.len());
        for (r, cfg) in coll.iter() {
            let other = loaded.get(r);
            assert_eq!(other.name(), cfg.name());
            assert_eq!(other.block_count(), cfg.block_count());
            assert_eq!(other.graph.edge_count(), cfg.graph.edge_count());
        }
        // caller lists survive the round trip
        assert_eq!(loaded.get(CfgRef(1)).callers.len(), 1);
    }

    #[test]
    fn test_load_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).is_err());
    }

    #[test]
    fn test_loader_pass_provides_cfg() {
        use crate::driver::{Pipeline, WorkSpace};
        use crate::hard::Platform;

        let coll = sample();
        let dir = tempfile::tempdir().unwrap();
        save(&coll, "t", dir.path()).unwrap();

        // registered first, the loader replaces CFG reconstruction
        let mut pipeline = Pipeline::new();
        pipeline.register(Box::new(LoadWorkspace {
            dir: dir.path().to_path_buf(),
        }));

        let mut ws = WorkSpace::new(Process::builder("t").build(), Platform::default());
        let mut ctx = Context::new(0x100);
        pipeline.require(CFG_FEATURE, &mut ws, &mut ctx).unwrap();
        assert_eq!(ws.collection().len(), 2);

        // and the saver writes it back out
        let out = tempfile::tempdir().unwrap();
        let mut pipeline2 = Pipeline::new();
        pipeline2.register(Box::new(SaveWorkspace {
            dir: out.path().to_path_buf(),
        }));
        pipeline2.register(Box::new(LoadWorkspace {
            dir: dir.path().to_path_buf(),
        }));
        pipeline2
            .require("workspace-saved", &mut WorkSpace::new(Process::builder("t").build(), Platform::default()), &mut Context::new(0x100))
            .unwrap();
        assert!(out.path().join("manifest.json").exists());
    }
}

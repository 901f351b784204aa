use anyhow::{Context as _, Result};
use kestrel::etime::TimingConfig;
use kestrel::hard::{self, Platform};
use kestrel::ilp::{dump, DumpFormat};
use kestrel::output::{cfg_to_dot, AnalysisReport};
use kestrel::{FlowFacts, LoaderConfig, LoaderRegistry, WcetConfig, WcetDriver, WorkSpace};
use std::path::PathBuf;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        print_usage();
        std::process::exit(1);
    }

    let options = match parse_options(&args[3..]) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_usage();
            std::process::exit(1);
        }
    };

    init_logging(&options.log_level);

    match run(&args[1], &args[2], options) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("Error: {:#}", e);
            let code = e
                .downcast_ref::<kestrel::Error>()
                .map(|e| e.exit_code())
                .unwrap_or(2);
            std::process::exit(code);
        }
    }
}

struct Options {
    processor: Option<PathBuf>,
    cache: Option<PathBuf>,
    memory: Option<PathBuf>,
    bht: Option<PathBuf>,
    flow_facts: Option<PathBuf>,
    ilp: String,
    virtualize: bool,
    unroll: bool,
    delta: bool,
    dump_cons: Option<PathBuf>,
    dump_format: DumpFormat,
    dump_graph: Option<PathBuf>,
    save_workspace: Option<PathBuf>,
    output: Option<PathBuf>,
    log_level: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            processor: None,
            cache: None,
            memory: None,
            bht: None,
            flow_facts: None,
            ilp: "cbc".into(),
            virtualize: true,
            unroll: false,
            delta: false,
            dump_cons: None,
            dump_format: DumpFormat::Default,
            dump_graph: None,
            save_workspace: None,
            output: None,
            log_level: "warn".into(),
        }
    }
}

fn parse_options(args: &[String]) -> std::result::Result<Options, String> {
    let mut opts = Options::default();
    let mut i = 0;

    let path_arg = |i: &mut usize| -> std::result::Result<PathBuf, String> {
        *i += 1;
        args.get(*i)
            .map(PathBuf::from)
            .ok_or_else(|| format!("missing value for '{}'", args[*i - 1]))
    };

    while i < args.len() {
        match args[i].as_str() {
            "--processor" => opts.processor = Some(path_arg(&mut i)?),
            "--cache" => opts.cache = Some(path_arg(&mut i)?),
            "--memory" => opts.memory = Some(path_arg(&mut i)?),
            "--bht" => opts.bht = Some(path_arg(&mut i)?),
            "--flow-facts" => opts.flow_facts = Some(path_arg(&mut i)?),
            "--dump-cons" => opts.dump_cons = Some(path_arg(&mut i)?),
            "--dump-graph" => opts.dump_graph = Some(path_arg(&mut i)?),
            "--save-workspace" => opts.save_workspace = Some(path_arg(&mut i)?),
            "--output" | "-o" => opts.output = Some(path_arg(&mut i)?),
            "--ilp" => {
                i += 1;
                opts.ilp = args
                    .get(i)
                    .cloned()
                    .ok_or_else(|| "missing value for '--ilp'".to_string())?;
            }
            "--dump-format" => {
                i += 1;
                let name = args
                    .get(i)
                    .ok_or_else(|| "missing value for '--dump-format'".to_string())?;
                opts.dump_format = DumpFormat::from_name(name)
                    .ok_or_else(|| format!("unknown dump format '{}'", name))?;
            }
            "--log-level" => {
                i += 1;
                opts.log_level = args
                    .get(i)
                    .cloned()
                    .ok_or_else(|| "missing value for '--log-level'".to_string())?;
            }
            "--virtualize" => opts.virtualize = true,
            "--no-virtualize" => opts.virtualize = false,
            "--unroll" => opts.unroll = true,
            "--delta" => opts.delta = true,
            other => return Err(format!("unknown option '{}'", other)),
        }
        i += 1;
    }
    Ok(opts)
}

fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_platform(opts: &Options) -> Result<Platform> {
    let mut platform = Platform::default();
    if let Some(path) = &opts.processor {
        let proc: hard::Processor = hard::load_toml(path)?;
        proc.validate()?;
        platform.processor = Some(proc);
    }
    if let Some(path) = &opts.cache {
        let caches: hard::CacheHierarchy = hard::load_toml(path)?;
        caches.validate()?;
        platform.caches = Some(caches);
    }
    if let Some(path) = &opts.memory {
        platform.memory = hard::load_toml(path)?;
    }
    if let Some(path) = &opts.bht {
        platform.bht = Some(hard::load_toml(path)?);
    }
    Ok(platform)
}

fn run(binary: &str, function: &str, opts: Options) -> Result<()> {
    let registry = LoaderRegistry::with_defaults();
    let process = registry
        .load(PathBuf::from(binary).as_path(), &LoaderConfig::default())
        .with_context(|| format!("loading {}", binary))?;

    let entry = process
        .symbol_by_name(function)
        .map(|s| s.address)
        .or_else(|| {
            // accept a literal address as the task entry
            function
                .strip_prefix("0x")
                .and_then(|h| u64::from_str_radix(h, 16).ok())
        })
        .ok_or_else(|| anyhow::anyhow!("no symbol '{}' in {}", function, binary))?;

    let platform = load_platform(&opts)?;
    let facts = match &opts.flow_facts {
        Some(path) => FlowFacts::load(path)?,
        None => FlowFacts::default(),
    };

    let mut ws = WorkSpace::new(process, platform);
    let config = WcetConfig {
        entry,
        virtualize: opts.virtualize,
        unroll: opts.unroll,
        facts,
        timing: TimingConfig::default(),
        delta: opts.delta,
        backend: opts.ilp.clone(),
    };

    // constraint dump wanted: generate without solving first
    if let Some(path) = &opts.dump_cons {
        let gen_config = WcetConfig {
            entry,
            virtualize: opts.virtualize,
            unroll: opts.unroll,
            facts: config.facts.clone(),
            timing: config.timing.clone(),
            delta: opts.delta,
            backend: opts.ilp.clone(),
        };
        let (_, sys) = WcetDriver::generate_only(&mut ws, gen_config)?;
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("creating {}", path.display()))?;
        dump::dump(&sys, opts.dump_format, &mut file)?;
        println!("constraints written to {}", path.display());
        // fresh workspace for the actual run
        ws = WorkSpace::new(
            registry.load(PathBuf::from(binary).as_path(), &LoaderConfig::default())?,
            load_platform(&opts)?,
        );
    }

    let result = WcetDriver::run(&mut ws, config)?;
    println!("WCET({}) = {} cycles", function, result.wcet);

    if let Some(path) = &opts.dump_graph {
        let dot = cfg_to_dot(ws.collection().entry_cfg());
        std::fs::write(path, dot)?;
        println!("CFG written to {}", path.display());
    }
    if let Some(dir) = &opts.save_workspace {
        kestrel::io::save(ws.collection(), function, dir)?;
    }
    if let Some(path) = &opts.output {
        AnalysisReport::new(binary, function, &result).write(path)?;
    }

    Ok(())
}

fn print_usage() {
    eprintln!("owcet - static WCET analysis");
    eprintln!();
    eprintln!("Usage: owcet BINARY FUNCTION [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --processor PATH      pipeline description (TOML)");
    eprintln!("  --cache PATH          cache hierarchy description (TOML)");
    eprintln!("  --memory PATH         memory bank description (TOML)");
    eprintln!("  --bht PATH            branch history table description (TOML)");
    eprintln!("  --flow-facts PATH     loop bounds and block facts (TOML)");
    eprintln!("  --ilp SOLVER          ILP back-end (default: cbc)");
    eprintln!("  --virtualize          inline calls before analysis (default)");
    eprintln!("  --no-virtualize       keep calls as synthetic blocks");
    eprintln!("  --unroll              peel the first iteration of loops");
    eprintln!("  --delta               use delta times in the objective");
    eprintln!("  --dump-cons PATH      write the ILP system before solving");
    eprintln!("  --dump-format FMT     default | lp_solve | cplex | mosek");
    eprintln!("  --dump-graph PATH     write the entry CFG as Graphviz dot");
    eprintln!("  --save-workspace DIR  persist the CFG collection");
    eprintln!("  --output PATH, -o     write a JSON analysis report");
    eprintln!("  --log-level LEVEL     error | warn | info | debug | trace");
    eprintln!();
    eprintln!("Exit codes: 0 success, 1 invalid arguments, 2 analysis error,");
    eprintln!("3 solver error.");
}

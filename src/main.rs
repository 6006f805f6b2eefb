use std::{
    io::{self, BufRead, Write},
    process::ExitCode,
};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use docrag::{
    Config,
    DataDir,
    PartitionRegistry,
    RagSession,
    StoreLayout,
    completion::create_completer,
    config::Overrides,
    embedding::create_embedder,
    error::Result,
    ingestion::{IngestOptions, PlainTextSource, build_store},
    rag::error_answer,
    registry::Expected,
    search,
    text_util::{DEFAULT_PREVIEW_CHARS, preview},
    walker::{build_matcher, discover_files},
};

mod cli;

use cli::{AskArgs, BuildArgs, Cli, Command, SearchArgs, StatusArgs};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DOCRAG_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(ExitCode::SUCCESS);
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config = Config::resolve(cli.config.as_deref(), &data_dir)?;

    match &cli.command {
        Command::Build(args) => cmd_build(config, &data_dir, args, cli.quiet),
        Command::Search(args) => cmd_search(config, &data_dir, args),
        Command::Ask(args) => cmd_ask(config, &data_dir, args),
        Command::Status(args) => {
            cmd_status(&config, &data_dir, cli.config.is_some(), args)
        }
        Command::Completions(_) => Ok(ExitCode::SUCCESS),
    }
}

fn cmd_build(
    mut config: Config,
    data_dir: &DataDir,
    args: &BuildArgs,
    quiet: bool,
) -> Result<ExitCode> {
    config.apply(Overrides {
        include: (!args.include.is_empty()).then(|| args.include.clone()),
        ..Overrides::default()
    })?;

    let matcher = build_matcher(&config.build.include)?;
    let files = discover_files(&args.docs_dir, &matcher)?;
    if files.is_empty() {
        eprintln!(
            "No documents matching {:?} in {}",
            config.build.include,
            args.docs_dir.display()
        );
        return Ok(ExitCode::SUCCESS);
    }

    let store = config.store_layout(data_dir);
    let embedder = create_embedder(&config.embedding)?;
    eprintln!(
        "Building {} document(s) from {} with {}...",
        files.len(),
        args.docs_dir.display(),
        embedder.model_name()
    );

    let options = IngestOptions {
        chunking: config.chunking.clone(),
        build: config.build_options(),
        prune: args.prune,
        progress: !quiet,
    };
    let report =
        build_store(&store, &files, &PlainTextSource, &*embedder, &options)?;

    eprintln!(
        "Built {} partition(s), skipped {} empty, {} failed, {} pruned",
        report.built, report.skipped, report.failed, report.pruned
    );
    eprintln!("  Index files:     {}", store.index_dir().display());
    eprintln!("  Chunk manifests: {}", store.manifest_dir().display());

    Ok(if report.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn cmd_search(
    mut config: Config,
    data_dir: &DataDir,
    args: &SearchArgs,
) -> Result<ExitCode> {
    config.apply(Overrides {
        top_k: args.top_k,
        threshold: args.threshold,
        ..Overrides::default()
    })?;

    let embedder = create_embedder(&config.embedding)?;
    let query = embedder.embed(&args.query)?;

    let expected = Expected {
        dims: Some(query.len()),
        metric: Some(config.retrieval.metric),
    };
    let store = config.store_layout(data_dir);
    let (registry, _) = PartitionRegistry::load_expecting(&store, &expected)?;

    let hits =
        search::search_vector(&registry, &query, &config.search_params())?;

    if args.json {
        println!("{}", search::format_json(&hits, &args.query)?);
    } else {
        println!("{}", search::format_human(&hits));
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_ask(
    mut config: Config,
    data_dir: &DataDir,
    args: &AskArgs,
) -> Result<ExitCode> {
    config.apply(Overrides {
        top_k: args.top_k,
        threshold: args.threshold,
        model: args.model.clone(),
        include: None,
    })?;

    let embedder = create_embedder(&config.embedding)?;
    let completer = create_completer(&config.completion)?;
    let mut session = RagSession::initialize(
        &config,
        config.store_layout(data_dir),
        embedder,
        completer,
    )?;

    let result = match &args.query {
        Some(query) => respond(&session, query, args),
        None => interactive(&mut session, args),
    };
    session.shutdown();
    result.map(|()| ExitCode::SUCCESS)
}

fn interactive(session: &mut RagSession, args: &AskArgs) -> Result<()> {
    println!(
        "docrag: {} partition(s) loaded ({} embeddings, {} answers).",
        session.registry().len(),
        session.embedder_name(),
        session.completer_name()
    );
    println!("Type 'help' for commands, 'quit' to exit.");

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("\nQuestion: ");
        io::stdout().flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            println!();
            break;
        }

        match line.trim() {
            "" => continue,
            "quit" | "exit" | "q" => break,
            "help" => print_help(),
            "reload" => match session.reload() {
                Ok(n) => println!("Reloaded {n} partition(s)."),
                Err(e) => eprintln!("Reload failed, nothing changed: {e}"),
            },
            query => respond(session, query, args)?,
        }
    }

    println!("Goodbye.");
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  help            show this message");
    println!("  reload          reload partitions from disk");
    println!("  quit, exit, q   leave the session");
    println!("Anything else is treated as a question.");
}

fn respond(session: &RagSession, query: &str, args: &AskArgs) -> Result<()> {
    let mut stdout = io::stdout();

    if args.stream {
        let answer = session.answer_stream(query);
        if args.show_context {
            print_context(&answer.context);
        }
        for token in answer.tokens {
            match token {
                Ok(text) => write!(stdout, "{text}")?,
                Err(e) => write!(stdout, "{}", error_answer(&e))?,
            }
            stdout.flush()?;
        }
        writeln!(stdout)?;
    } else {
        let answer = session.answer(query);
        if args.show_context {
            print_context(&answer.context);
        }
        writeln!(stdout, "{}", answer.text)?;
    }
    Ok(())
}

fn print_context(hits: &[search::SearchHit]) {
    if hits.is_empty() {
        println!("(no relevant context found)");
        return;
    }
    println!("Context:");
    for hit in hits {
        println!(
            "  [{:.3}] {} #{}: {}",
            hit.similarity,
            hit.partition_id,
            hit.ordinal,
            preview(&hit.text, DEFAULT_PREVIEW_CHARS)
        );
    }
    println!();
}

fn cmd_status(
    config: &Config,
    data_dir: &DataDir,
    explicit_config: bool,
    args: &StatusArgs,
) -> Result<ExitCode> {
    let store = config.store_layout(data_dir);
    let config_source = if explicit_config {
        "--config".to_string()
    } else if data_dir.config_file().is_file() {
        data_dir.config_file().display().to_string()
    } else {
        "defaults".to_string()
    };

    let summary = StoreSummary::collect(&store);

    if args.json {
        let json = serde_json::json!({
            "data_dir": data_dir.root(),
            "config": config_source,
            "index_dir": store.index_dir(),
            "manifest_dir": store.manifest_dir(),
            "embedding_model": config.embedding.model,
            "completion_model": config.completion.model,
            "metric": config.retrieval.metric.name(),
            "top_k": config.retrieval.top_k,
            "similarity_threshold": config.retrieval.similarity_threshold,
            "partitions": summary.partitions,
            "chunks": summary.chunks,
            "dims": summary.dims,
            "unpaired_indexes": summary.unpaired_indexes,
            "unpaired_manifests": summary.unpaired_manifests,
        });
        println!("{json}");
    } else {
        println!("Data directory:   {}", data_dir.root().display());
        println!("Config:           {config_source}");
        println!("Index directory:  {}", store.index_dir().display());
        println!("Chunk manifests:  {}", store.manifest_dir().display());
        println!("Embedding model:  {}", config.embedding.model);
        println!("Completion model: {}", config.completion.model);
        println!(
            "Retrieval:        top {} by {}{}",
            config.retrieval.top_k,
            config.retrieval.metric,
            config
                .retrieval
                .similarity_threshold
                .map(|t| format!(", similarity >= {t}"))
                .unwrap_or_default()
        );
        println!("Partitions:       {}", summary.partitions);
        println!("Chunks:           {}", summary.chunks);
        if let Some(dims) = summary.dims {
            println!("Dimensions:       {dims}");
        }
        for id in &summary.unpaired_indexes {
            println!("  index without manifest: {id}");
        }
        for id in &summary.unpaired_manifests {
            println!("  manifest without index: {id}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Default)]
struct StoreSummary {
    partitions: usize,
    chunks: usize,
    dims: Option<usize>,
    unpaired_indexes: Vec<String>,
    unpaired_manifests: Vec<String>,
}

impl StoreSummary {
    fn collect(store: &StoreLayout) -> Self {
        let index_ids = store.list_index_ids().unwrap_or_default();
        let manifest_ids = store.list_manifest_ids().unwrap_or_default();

        let mut summary = Self {
            unpaired_indexes: index_ids
                .iter()
                .filter(|id| !manifest_ids.contains(id))
                .cloned()
                .collect(),
            unpaired_manifests: manifest_ids
                .iter()
                .filter(|id| !index_ids.contains(id))
                .cloned()
                .collect(),
            ..Self::default()
        };

        if let Ok((registry, loaded)) = PartitionRegistry::load(store) {
            summary.partitions = loaded;
            summary.chunks = registry.chunk_count();
            summary.dims = registry.dims();
        }
        summary
    }
}

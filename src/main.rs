use anyhow::{Context, Result};
use dgex::cli::{parse_args, setup_logging, BaselineArgs, Commands, DataArgs, PredictArgs, RunArgs, ScoreArgs};
use dgex::data::loader::{load_id_map, load_labeled_table, load_prediction};
use dgex::data::DataSources;
use dgex::ensemble::orchestrator::{EnsembleOrchestrator, EnsembleOutcome};
use dgex::ensemble::EnsembleConfig;
use dgex::predict::baseline::Baseline;
use dgex::predict::ScoreReport;
use dgex::TrainingBackend;
use tracing::{error, info};

fn main() {
    let cli = parse_args();

    setup_logging(cli.verbose);

    info!("{}", dgex::info());

    let result = match cli.command {
        Commands::Run(args) => run_ensemble(args),
        Commands::Predict(args) => run_predict(args),
        Commands::Baseline(args) => run_baseline(args),
        Commands::Score(args) => run_score(args),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_sources(data: &DataArgs) -> Result<DataSources> {
    info!("Loading labelled table from {:?}", data.train);
    let table = load_labeled_table(&data.train)
        .with_context(|| format!("Failed to load labelled table from {:?}", data.train))?;
    let id_map = load_id_map(&data.id_map)
        .with_context(|| format!("Failed to load id map from {:?}", data.id_map))?;
    info!(
        "Loaded {} labelled rows x {} genes, {} pairs to predict",
        table.n_samples(),
        table.n_genes(),
        id_map.len()
    );
    Ok(DataSources { table, id_map })
}

fn execute(config: EnsembleConfig, data: &DataArgs) -> Result<EnsembleOutcome> {
    let sources = load_sources(data)?;
    let device = config.device()?;

    let orchestrator = EnsembleOrchestrator::<TrainingBackend>::new(config, device);
    let outcome = orchestrator.run(&sources).context("Ensemble run failed")?;

    outcome
        .prediction
        .save(&data.output, &sources.id_map.ids, &sources.table.genes)?;
    info!("Predictions saved to: {:?}", data.output);
    Ok(outcome)
}

fn run_ensemble(args: RunArgs) -> Result<()> {
    let mut config = args.overrides.resolve()?;
    if let Some(store) = args.store {
        config.store_dir = Some(store);
    }
    if let Some(dir) = args.metrics_dir {
        config.metrics_dir = Some(dir);
    }
    config.reuse_artifacts = false;

    let outcome = execute(config, &args.data)?;

    info!("\n=== Member Results ===");
    for report in &outcome.reports {
        info!(
            "  {} (w={}): {} train / {} val, best epoch {}, best MRRMSE {}",
            report.name,
            report.weight,
            report.n_train,
            report.n_val,
            report.best_epoch.map_or_else(|| "-".to_string(), |e| (e + 1).to_string()),
            report.best_mrrmse.map_or_else(|| "-".to_string(), |m| format!("{:.4}", m)),
        );
    }

    if let Some(path) = args.report {
        std::fs::write(&path, serde_json::to_string_pretty(&outcome.reports)?)
            .with_context(|| format!("Failed to write report {:?}", path))?;
        info!("Member reports saved to: {:?}", path);
    }
    Ok(())
}

fn run_predict(args: PredictArgs) -> Result<()> {
    let mut config = args.overrides.resolve()?;
    config.store_dir = Some(args.store);
    config.reuse_artifacts = true;

    execute(config, &args.data)?;
    Ok(())
}

fn run_baseline(args: BaselineArgs) -> Result<()> {
    let method: Baseline = args.method.parse()?;
    let sources = load_sources(&args.data)?;

    info!("Writing {} baseline", method);
    let prediction = method.predict(sources.table.values.view(), sources.id_map.len())?;
    prediction.save(&args.data.output, &sources.id_map.ids, &sources.table.genes)?;
    info!("Predictions saved to: {:?}", args.data.output);
    Ok(())
}

fn run_score(args: ScoreArgs) -> Result<()> {
    let truth = load_labeled_table(&args.truth)
        .with_context(|| format!("Failed to load ground truth from {:?}", args.truth))?;
    let prediction = load_prediction(&args.prediction)
        .with_context(|| format!("Failed to load prediction from {:?}", args.prediction))?;

    let values = prediction.select_genes(&truth.genes)?;
    let report = ScoreReport::compute(values.view(), truth.values.view())?;
    report.print();

    if let Some(output) = args.output {
        std::fs::write(&output, serde_json::to_string_pretty(&report)?)?;
        info!("Score report saved to: {:?}", output);
    }
    Ok(())
}

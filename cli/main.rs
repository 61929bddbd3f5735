#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use insurance_pricing::data::{load_raw, load_source, stratified_split, write_prepared};
use insurance_pricing::extrapolation::check_extrapolation;
use insurance_pricing::metrics;
use insurance_pricing::pipeline::PricingEngine;
use insurance_pricing::predictor::{LinearPredictor, Predictor};
use insurance_pricing::schema::{RawInput, Region, Sex, Smoker};
use insurance_pricing::settings::Settings;
use insurance_pricing::transform::{FitOptions, TransformState};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(
    name = "pricing",
    about = "Fit, apply and explain the insurance premium feature transform",
    long_about = "Prepares training data and the persisted feature transformer, reports \
                 extrapolation for an applicant, and produces explained charge estimates \
                 from a linear predictor artifact."
)]
struct Cli {
    /// Settings file (TOML); environment variables override its values
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// One applicant's raw attributes, or a CSV of applicants via `--batch`.
#[derive(Args)]
struct ApplicantArgs {
    #[arg(long, required_unless_present = "batch")]
    age: Option<u32>,

    /// female | male
    #[arg(long, required_unless_present = "batch")]
    sex: Option<Sex>,

    #[arg(long, required_unless_present = "batch")]
    bmi: Option<f64>,

    #[arg(long, required_unless_present = "batch")]
    children: Option<u32>,

    /// no | yes
    #[arg(long, required_unless_present = "batch")]
    smoker: Option<Smoker>,

    /// northeast | northwest | southeast | southwest
    #[arg(long, required_unless_present = "batch")]
    region: Option<Region>,

    /// Raw CSV of applicants to process row by row instead of the flags above
    #[arg(long, value_name = "PATH", conflicts_with_all = ["age", "sex", "bmi", "children", "smoker", "region"])]
    batch: Option<PathBuf>,
}

impl ApplicantArgs {
    fn to_input(&self) -> Result<RawInput, String> {
        fn required<T: Clone>(value: &Option<T>, flag: &str) -> Result<T, String> {
            value.clone().ok_or_else(|| format!("--{flag} is required"))
        }
        let input = RawInput {
            age: required(&self.age, "age")?,
            sex: required(&self.sex, "sex")?,
            bmi: required(&self.bmi, "bmi")?,
            children: required(&self.children, "children")?,
            smoker: required(&self.smoker, "smoker")?,
            region: required(&self.region, "region")?,
        };
        input.validate().map_err(|e| e.to_string())?;
        Ok(input)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Split the source data, fit the transformer and write prepared train/test sets
    #[command(about = "Fit the feature transformer (outputs: transformer artifact, train/test CSVs)")]
    Prepare {
        /// Source CSV with age,sex,bmi,children,smoker,region,charges
        #[arg(long, value_name = "PATH")]
        source: Option<PathBuf>,

        /// Fit the transformer without standardizing the log target
        #[arg(long)]
        no_target_scaling: bool,
    },

    /// Report extrapolation warnings for one applicant
    #[command(about = "Check an applicant against the fitted training ranges")]
    Check {
        #[command(flatten)]
        applicant: ApplicantArgs,
    },

    /// Produce an explained estimate for one applicant, or one JSON line per CSV row
    #[command(about = "Estimate and explain charges (outputs: JSON on stdout)")]
    Predict {
        #[command(flatten)]
        applicant: ApplicantArgs,

        /// Linear predictor artifact (overrides the settings)
        #[arg(long, value_name = "PATH")]
        model: Option<PathBuf>,

        /// Number of raw-feature contributions to keep (overrides the settings)
        #[arg(long, value_name = "K")]
        top_k: Option<usize>,
    },

    /// Score a linear predictor on a raw CSV that carries charges
    #[command(about = "Evaluate dollar-space R², MAPE and SMAPE")]
    Evaluate {
        /// Raw CSV with charges; defaults to the configured source data
        #[arg(long, value_name = "PATH")]
        data: Option<PathBuf>,

        /// Linear predictor artifact (overrides the settings)
        #[arg(long, value_name = "PATH")]
        model: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { config, command } = Cli::parse();
    let result: CliResult = match command {
        Some(Commands::Version) => {
            println!("pricing {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(command) => {
            Settings::load(config.as_deref(), |name| std::env::var(name).ok())
                .map_err(Into::into)
                .and_then(|settings| run(command, &settings))
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(command: Commands, settings: &Settings) -> CliResult {
    match command {
        Commands::Prepare {
            source,
            no_target_scaling,
        } => prepare(settings, source.as_deref(), no_target_scaling),
        Commands::Check { applicant } => check(settings, &applicant),
        Commands::Predict {
            applicant,
            model,
            top_k,
        } => predict(settings, &applicant, model.as_deref(), top_k),
        Commands::Evaluate { data, model } => evaluate(settings, data.as_deref(), model.as_deref()),
        Commands::Version => Ok(()),
    }
}

fn prepare(settings: &Settings, source: Option<&Path>, no_target_scaling: bool) -> CliResult {
    let source = source.unwrap_or(&settings.source_data_path);
    println!("Loading source data from: {}", source.display());
    let frame = load_source(source)?;

    let (train, test) = stratified_split(&frame, settings.test_fraction, settings.split_seed)?;
    println!("Split {} rows into {} train / {} test", frame.len(), train.len(), test.len());

    let options = FitOptions {
        scale_target: !no_target_scaling,
        ..FitOptions::default()
    };
    let state = TransformState::fit(&train, options)?;
    state.save(&settings.transformer_path)?;
    println!("Transformer artifact saved to {}", settings.transformer_path.display());

    for (split, path) in [(&train, &settings.train_data_path), (&test, &settings.test_data_path)] {
        let (features, target) = state.transform_with_target(split)?;
        write_prepared(path, &features, &target)?;
        println!("Wrote {} ({} rows)", path.display(), split.len());
    }
    println!("Features: {:?}", state.feature_columns);
    Ok(())
}

fn check(settings: &Settings, applicant: &ApplicantArgs) -> CliResult {
    let state = TransformState::load(&settings.transformer_path)?;

    let Some(batch) = &applicant.batch else {
        let warnings = check_extrapolation(&applicant.to_input()?, &state);
        if warnings.is_empty() {
            println!("No extrapolation warnings.");
        }
        for warning in &warnings {
            println!("{warning}");
        }
        return Ok(());
    };

    let inputs = load_raw(batch)?.to_inputs()?;
    let mut flagged = 0usize;
    for (row, input) in inputs.iter().enumerate() {
        let warnings = check_extrapolation(input, &state);
        if !warnings.is_empty() {
            flagged += 1;
        }
        for warning in &warnings {
            println!("Row {}: {warning}", row + 1);
        }
    }
    println!("{flagged} of {} rows extrapolate beyond the training data.", inputs.len());
    Ok(())
}

fn load_predictor(
    settings: &Settings,
    model: Option<&Path>,
    state: &TransformState,
) -> Result<LinearPredictor, Box<dyn std::error::Error>> {
    let path = model.unwrap_or(&settings.model_path);
    let predictor = LinearPredictor::load(path)?;
    predictor.check_features(&state.feature_columns)?;
    Ok(predictor)
}

fn predict(
    settings: &Settings,
    applicant: &ApplicantArgs,
    model: Option<&Path>,
    top_k: Option<usize>,
) -> CliResult {
    let state = Arc::new(TransformState::load(&settings.transformer_path)?);
    let predictor = load_predictor(settings, model, &state)?;
    let mut engine = PricingEngine::from_settings(Arc::clone(&state), Arc::new(predictor), settings);
    if let Some(top_k) = top_k {
        engine = engine.with_top_k(top_k);
    }

    let Some(batch) = &applicant.batch else {
        let estimate = engine.estimate(&applicant.to_input()?)?;
        println!("{}", serde_json::to_string_pretty(&estimate)?);
        return Ok(());
    };

    let inputs = load_raw(batch)?.to_inputs()?;
    let mut failures = 0usize;
    for (row, result) in engine.estimate_batch(&inputs).into_iter().enumerate() {
        match result {
            Ok(estimate) => println!("{}", serde_json::to_string(&estimate)?),
            Err(e) => {
                failures += 1;
                eprintln!("Row {}: {e}", row + 1);
            }
        }
    }
    if failures > 0 {
        return Err(format!("{failures} of {} rows could not be estimated", inputs.len()).into());
    }
    Ok(())
}

fn evaluate(settings: &Settings, data: Option<&Path>, model: Option<&Path>) -> CliResult {
    let data = data.unwrap_or(&settings.source_data_path);
    let state = TransformState::load(&settings.transformer_path)?;
    let predictor = load_predictor(settings, model, &state)?;

    let frame = load_raw(data)?;
    let charges = frame
        .charges
        .clone()
        .ok_or("evaluation data must include a charges column")?;
    let features = state.transform(&frame)?;
    let raw = predictor.predict(features.values.view())?;
    let predicted = state.inverse_transform_target(raw.view());

    let scores = metrics::evaluate(charges.view(), predicted.view())?;
    println!(
        "Evaluation of {} on {}",
        predictor.version().unwrap_or("linear predictor"),
        data.display()
    );
    println!("{scores}");
    Ok(())
}

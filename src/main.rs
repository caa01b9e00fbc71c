mod assertions;
mod engine;
mod errors;
mod events;
mod executors;
mod extract;
mod kv;
mod limits;
mod loader;
mod protocol;
mod resolve;
mod scene;
mod store;
mod telemetry;
mod validation;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use engine::Run;
use kv::MemoryKv;
use limits::EngineDefaults;

#[derive(Parser)]
#[command(name = "scene-runner")]
#[command(about = "API scenario runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Executes a scenario file
    Execute {
        /// Path to the scenario JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// JSON file with external key-value data
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Path to the output report file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let telemetry_config = telemetry::TelemetryConfig::from_env();
    if let Err(e) = telemetry::init_telemetry(&telemetry_config) {
        eprintln!("❌ Failed to initialize telemetry: {}", e);
        std::process::exit(1);
    }

    match &cli.command {
        Commands::Execute { file, data, output } => {
            execute_scenarios(file, data, output).await;
        }
    }

    telemetry::shutdown_telemetry();
}

async fn execute_scenarios(
    file_path: &PathBuf,
    data_path: &Option<PathBuf>,
    output_path: &Option<PathBuf>,
) {
    println!("🚀 Scene Runner Initializing...");

    // 1. Load Scenes
    let scenes = match loader::load_scenes_from_file(file_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("❌ Failed to load scenario: {}", e);
            std::process::exit(1);
        }
    };
    println!("📋 Scenario Loaded: {} scene(s)", scenes.len());

    // 2. Validate
    if let Err(errors) = validation::validate_run(&scenes) {
        eprintln!("❌ Scenario is invalid:");
        for error in errors {
            eprintln!("   [{}] {}", error.code(), error);
        }
        std::process::exit(1);
    }

    // 3. Wire collaborators
    let mut run = Run::new(scenes).with_defaults(EngineDefaults::from_env());
    if let Some(path) = data_path {
        match MemoryKv::load_json_file(path).await {
            Ok(store) => {
                run = run.with_kv(Arc::new(store));
                println!("🗂️  Key-value data loaded from {:?}", path);
            }
            Err(e) => {
                eprintln!("❌ Failed to load key-value data: {}", e);
                std::process::exit(1);
            }
        }
    }

    // Ctrl-C aborts in-flight scenes and unblocks waiting consumers.
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("⚠️  Cancellation requested, aborting scenes...");
            canceller.cancel();
        }
    });

    // 4. Execute
    println!("▶️  Starting Run {}...", run.run_id());
    let report = run.start(cancel).await;
    println!("🏁 Run Finished: {}", report.status);

    // 5. Save Report
    let json = match serde_json::to_string_pretty(&report) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("❌ Failed to serialize report: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(path) = output_path {
        if let Err(e) = fs::write(path, json) {
            eprintln!("❌ Failed to write report: {}", e);
        } else {
            println!("📄 Report saved to: {:?}", path);
        }
    } else {
        println!("\n--- Run Report ---\n{}", json);
    }
}

use anyhow::Result;
use clap::{Parser, Subcommand};
use common::stages::output_file_name;
use common::wordcount::{decode_counts, wordcount_file};
use common::{LocalCluster, PeerConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "Word count distribuido sobre un cluster local de peers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Levanta N peers en memoria y corre un word count sobre un directorio
    Run {
        /// Directorio (o archivo) de entrada
        #[arg(long, value_name = "DIR")]
        input: PathBuf,

        /// Cantidad de peers del cluster
        #[arg(long, default_value_t = 3)]
        peers: usize,

        /// Ejecuciones por split que espera el reduce (MR_EXECUTIONS)
        #[arg(long)]
        executions: Option<u32>,

        /// Invocaciones en paralelo por peer (MR_MAX_CONCURRENCY)
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Tamaño máximo de split en bytes, 0 = archivo entero (MR_SPLIT_BYTES)
        #[arg(long)]
        split_bytes: Option<usize>,

        /// Tope de reenvíos por buffer de replay (MR_MAX_RESENDS)
        #[arg(long)]
        max_resends: Option<u32>,

        /// No adjuntar buffers de replay a los Gets
        #[arg(long)]
        no_replay: bool,

        /// Directorio donde escribir el CSV final
        #[arg(long, value_name = "DIR")]
        output: Option<PathBuf>,

        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },

    /// Word count local de un solo archivo, sin cluster
    Count {
        #[arg(value_name = "ARCHIVO")]
        input: PathBuf,

        /// CSV de salida
        #[arg(long, default_value = "wordcount.csv")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("client=info,common=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            peers,
            executions,
            max_concurrency,
            split_bytes,
            max_resends,
            no_replay,
            output,
            timeout_secs,
        } => {
            let mut config = PeerConfig::from_env()?;
            if let Some(n) = executions {
                config.executions = n;
            }
            if let Some(n) = max_concurrency {
                config.max_concurrency = n;
            }
            if let Some(n) = split_bytes {
                config.max_split_bytes = n;
            }
            if let Some(n) = max_resends {
                config.max_resends = n;
            }
            if no_replay {
                config.replay_enabled = false;
            }
            info!("config: {:?}", config);

            let mut cluster = LocalCluster::start(&config, peers, output.clone())?;
            let result = cluster
                .run_job(&input, Duration::from_secs(timeout_secs))
                .await;
            let overlay = cluster.overlay().clone();
            cluster.shutdown();
            let (job, outcome) = result?;

            println!("Job terminado:");
            println!("  id: {}", job.id);
            println!("  agregado: {}", outcome.aggregate);
            println!("  salida: {}", outcome.output);
            if let Some(dir) = &output {
                println!("  csv: {}", dir.join(output_file_name(&job.id)).display());
            } else if let Some(bytes) = overlay.value(&outcome.aggregate) {
                for (word, count) in decode_counts(&bytes)? {
                    println!("{},{}", word, count);
                }
            }
        }
        Commands::Count { input, output } => {
            let counts = wordcount_file(&input, &output)?;
            println!(
                "{} palabras distintas, escrito en {}",
                counts.len(),
                output.display()
            );
        }
    }

    Ok(())
}

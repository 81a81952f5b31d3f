use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use std::env;

use commit_protocol::{
    config::parse_key_value,
    executor::ExecutorMetrics,
    job::{JobInfo, JobRequest},
    results::JobResults,
    Configuration,
};

/// - En Docker: DRIVER_URL=http://driver:8080
/// - Local: default http://localhost:8080
fn driver_base_url() -> String {
    env::var("DRIVER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Debug, Parser)]
#[command(name = "client")]
#[command(about = "CLI para mandar jobs al driver y ver cómo se comprometen")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Envía un job de WordCount: una tarea por archivo de entrada
    Submit {
        #[arg(value_name = "NOMBRE")]
        name: String,

        /// Patrón de entrada, ej: "/data/input/*.txt"
        #[arg(value_name = "INPUT_GLOB")]
        input_glob: String,

        /// Directorio final; si falta lo elige el driver
        #[arg(long)]
        output_dir: Option<String>,

        /// Protocolo de commit registrado en el driver
        #[arg(long, default_value = "sql-mapreduce")]
        committer: String,

        /// Columna de partición (`<col>=<archivo>`)
        #[arg(long)]
        partition_by: Option<String>,

        /// Reemplaza solo las particiones que escribió el job
        #[arg(long)]
        dynamic: bool,

        #[arg(long)]
        overwrite: bool,

        #[arg(long)]
        insert_into_relation: bool,

        /// Partición estática `col=valor`, se puede repetir
        #[arg(long = "static-partition", value_name = "COL=VALOR")]
        static_partitions: Vec<String>,

        /// Clave de configuración `k=v`, se puede repetir
        #[arg(long = "conf", value_name = "K=V")]
        conf: Vec<String>,
    },
    /// Consulta el estado de un job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lista los archivos comprometidos de un job
    Results {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lista los executors registrados
    Executors,
}

fn parse_pairs(raw: &[String], what: &str) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|s| parse_key_value(s).ok_or_else(|| anyhow!("{what} inválido: '{s}' (se espera k=v)")))
        .collect()
}

fn build_request(command: Commands) -> Result<JobRequest> {
    let Commands::Submit {
        name,
        input_glob,
        output_dir,
        committer,
        partition_by,
        dynamic,
        overwrite,
        insert_into_relation,
        static_partitions,
        conf,
    } = command
    else {
        bail!("build_request solo sirve para submit");
    };

    let conf: Configuration = parse_pairs(&conf, "--conf")?.into_iter().collect();
    Ok(JobRequest {
        name,
        input_glob,
        output_dir,
        committer,
        partition_by,
        dynamic_partition_overwrite: dynamic,
        insert_into_relation,
        overwrite,
        static_partitions: parse_pairs(&static_partitions, "--static-partition")?,
        conf,
    })
}

fn print_job(job: &JobInfo) {
    println!("Job:");
    println!("  id: {}", job.id);
    println!("  nombre: {}", job.name);
    println!("  estado: {:?}", job.status);
    println!("  protocolo: {}", job.committer);
    println!(
        "  tareas: total={}, comprometidas={}, attempts fallidos={}, reintentos={}",
        job.total_tasks, job.committed_tasks, job.failed_attempts, job.retries
    );
    if job.total_tasks > 0 {
        let pct = (job.committed_tasks as f64 / job.total_tasks as f64) * 100.0;
        println!("  progreso: {:.1}%", pct);
    } else {
        println!("  progreso: (sin tareas)");
    }
    println!("  input_glob: {}", job.input_glob);
    println!("  output_dir: {}", job.output_dir);
    println!("  submitted_at: {}", job.submitted_at);
    if let Some(ref started) = job.started_at {
        println!("  iniciado: {}", started);
    }
    if let Some(ref done) = job.finished_at {
        println!("  finalizado: {}", done);
    }
    if let Some(attempts) = job.commit_attempts {
        println!("  intentos de commit: {}", attempts);
    }
    if let Some(ref err) = job.error {
        println!("  error: {}", err);
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = driver_base_url();

    match cli.command {
        submit @ Commands::Submit { .. } => {
            let req = build_request(submit)?;
            let url = format!("{}/api/v1/jobs", base_url);
            let resp = client
                .post(&url)
                .json(&req)
                .send()
                .await
                .with_context(|| format!("no se pudo hablar con {base_url}"))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!("el driver rechazó el job ({status}): {body}");
            }
            let job: JobInfo = resp.json().await?;
            println!("Job creado:");
            print_job(&job);
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/jobs/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let job: JobInfo = resp.json().await?;
                print_job(&job);
            } else {
                println!("Error: job no encontrado (status {})", resp.status());
            }
        }

        Commands::Results { id } => {
            let url = format!("{}/api/v1/jobs/{id}/results", base_url);
            let resp = client.get(&url).send().await?;

            if resp.status().is_success() {
                let results: JobResults = resp.json().await?;
                println!("Resultados para job {}:", results.job_id);
                println!("  directorio de salida: {}", results.output_dir);
                println!(
                    "  _SUCCESS: {}",
                    if results.success_marker { "sí" } else { "no" }
                );
                if results.files.is_empty() {
                    println!("  (sin archivos de salida)");
                } else {
                    println!("  archivos:");
                    for f in results.files {
                        println!("    - {}", f);
                    }
                }
            } else {
                println!("No se encontraron resultados para job {id}");
            }
        }

        Commands::Executors => {
            let url = format!("{}/api/v1/executors", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let executors: Vec<ExecutorMetrics> = resp.json().await?;
                if executors.is_empty() {
                    println!("No hay executors registrados.");
                }
                for e in executors {
                    println!("Executor {}", e.executor_id);
                    println!("  host           : {}", e.hostname);
                    println!("  dead           : {}", e.dead);
                    println!("  last_heartbeat : {} s ago", e.last_heartbeat_secs_ago);
                    println!("  concurrency    : max={}, activas={}", e.max_concurrency, e.active_tasks);
                    println!(
                        "  attempts       : started={}, committed={}, failed={}",
                        e.tasks_started, e.tasks_committed, e.tasks_failed
                    );
                    match e.avg_task_ms {
                        Some(avg) => println!("  avg_task_ms    : {:.1}", avg),
                        None => println!("  avg_task_ms    : (sin datos)"),
                    }
                    println!();
                }
            } else {
                println!(
                    "Error consultando /api/v1/executors (status {})",
                    resp.status()
                );
            }
        }
    }

    Ok(())
}

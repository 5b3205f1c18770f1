use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use cueline_engine::environment::{environment_from_value, Environment, EnvironmentCatalog};
use cueline_engine::model::program_from_value;
use cueline_engine::planner::{plan, PlannerOptions};
use cueline_engine::scheduler::{run_simulated, CodeExecutor, NullExecutor, ShellExecutor};
use cueline_engine::simulate::Bottleneck;
use cueline_engine::validator::validate_document;

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
enum Request {
    /// Validate a program document against the supplied environments.
    #[serde(rename_all = "camelCase")]
    Validate {
        program: serde_json::Value,
        #[serde(default)]
        environments: Vec<serde_json::Value>,
        #[serde(default)]
        strict: bool,
    },
    /// Rewrite a program to reduce resource contention.
    #[serde(rename_all = "camelCase")]
    Plan {
        program: serde_json::Value,
        #[serde(default)]
        environments: Vec<serde_json::Value>,
    },
    /// Execute a program in simulated time and report the trace.
    #[serde(rename_all = "camelCase")]
    Run {
        program: serde_json::Value,
        #[serde(default)]
        environments: Vec<serde_json::Value>,
        #[serde(default = "default_time_scale")]
        time_scale: f64,
        #[serde(default = "default_max_seconds")]
        max_seconds: f64,
        /// Run step code blocks through the shell instead of skipping them.
        #[serde(default)]
        execute_code_blocks: bool,
    },
}

fn default_time_scale() -> f64 {
    1.0
}

fn default_max_seconds() -> f64 {
    3600.0
}

#[derive(Debug, Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    data: T,
}

#[derive(Debug, Serialize)]
struct ErrResponse {
    ok: bool,
    error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlanData {
    program: serde_json::Value,
    bottlenecks: Vec<Bottleneck>,
    notes: Vec<String>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn build_catalog(documents: Vec<serde_json::Value>) -> Result<EnvironmentCatalog, String> {
    let mut catalog = EnvironmentCatalog::new();
    for document in documents {
        let environment = environment_from_value(document)
            .map_err(|e| format!("invalid environment document: {}", e))?;
        catalog.insert(environment);
    }
    Ok(catalog)
}

/// The environment the planner should analyze against, if the program names
/// one by id or by type.
fn planner_environment<'a>(
    catalog: &'a EnvironmentCatalog,
    environment: &Option<String>,
    environment_type: &'a Option<String>,
) -> Option<&'a Environment> {
    match (environment, environment_type) {
        (Some(id), _) => catalog.get(id),
        (None, Some(kind)) => catalog.default_for_type(kind),
        (None, None) => None,
    }
}

fn write_ok<T: Serialize>(data: T) {
    let resp = OkResponse { ok: true, data };
    let json = serde_json::to_string(&resp)
        .unwrap_or_else(|e| format!("{{\"ok\":false,\"error\":\"serialization error: {}\"}}", e));
    println!("{}", json);
    let _ = io::stdout().flush();
}

fn write_err(msg: impl std::fmt::Display) -> ! {
    let resp = ErrResponse {
        ok: false,
        error: msg.to_string(),
    };
    let json = serde_json::to_string(&resp)
        .unwrap_or_else(|_| "{\"ok\":false,\"error\":\"double serialization error\"}".to_string());
    println!("{}", json);
    let _ = io::stdout().flush();
    std::process::exit(1);
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let mut input = String::new();
    if let Err(e) = io::stdin().read_to_string(&mut input) {
        write_err(format!("Failed to read stdin: {}", e));
    }

    let request: Request = match serde_json::from_str(&input) {
        Ok(r) => r,
        Err(e) => write_err(format!("Invalid JSON input: {}", e)),
    };

    match request {
        Request::Validate {
            program,
            environments,
            strict,
        } => {
            let catalog = match build_catalog(environments) {
                Ok(c) => c,
                Err(e) => write_err(e),
            };
            let report = validate_document(&program, &catalog, strict);
            let is_valid = report.is_valid;
            write_ok(report);
            if !is_valid {
                std::process::exit(1);
            }
        }
        Request::Plan {
            program,
            environments,
        } => {
            let catalog = match build_catalog(environments) {
                Ok(c) => c,
                Err(e) => write_err(e),
            };
            let program = match program_from_value(program) {
                Ok(p) => p,
                Err(e) => write_err(format!("Invalid program document: {}", e)),
            };
            let environment =
                planner_environment(&catalog, &program.environment, &program.environment_type);
            match plan(&program, environment, PlannerOptions::default()) {
                Ok(outcome) => {
                    let planned = match serde_json::to_value(&outcome.program) {
                        Ok(v) => v,
                        Err(e) => write_err(format!("Failed to serialize plan: {}", e)),
                    };
                    write_ok(PlanData {
                        program: planned,
                        bottlenecks: outcome.bottlenecks,
                        notes: outcome.notes,
                    });
                }
                Err(e) => write_err(e),
            }
        }
        Request::Run {
            program,
            environments,
            time_scale,
            max_seconds,
            execute_code_blocks,
        } => {
            let catalog = match build_catalog(environments) {
                Ok(c) => c,
                Err(e) => write_err(e),
            };
            let program = match program_from_value(program) {
                Ok(p) => p,
                Err(e) => write_err(format!("Invalid program document: {}", e)),
            };
            let resolved = match catalog.resolve(&program) {
                Ok(r) => r,
                Err(e) => write_err(e),
            };
            let executor: Box<dyn CodeExecutor> = if execute_code_blocks {
                Box::new(ShellExecutor)
            } else {
                Box::new(NullExecutor)
            };
            let report = run_simulated(&program, &resolved, executor, time_scale, max_seconds, 0.05);
            write_ok(report);
        }
    }
}

use serde::Serialize;

use crate::cli::Cli;
use crate::error::SimError;

/// JSON response envelope
#[derive(Serialize)]
pub struct JsonResponse<T: Serialize> {
    pub schema_version: u32,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonError>,
}

#[derive(Serialize)]
pub struct JsonError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

/// Output a successful result
pub fn output_success<T: Serialize>(cli: &Cli, data: T) -> Result<(), SimError> {
    if cli.json {
        let response = JsonResponse {
            schema_version: 1,
            ok: true,
            data: Some(data),
            error: None,
        };
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else if !cli.quiet {
        println!("{}", serde_json::to_string_pretty(&data)?);
    }
    Ok(())
}

/// Output an error
pub fn output_error(cli: &Cli, err: &SimError) {
    let divergence = err.divergence();
    if cli.json {
        let response: JsonResponse<()> = JsonResponse {
            schema_version: 1,
            ok: false,
            data: None,
            error: Some(JsonError {
                code: err.error_code().to_string(),
                message: err.to_string(),
                details: match divergence {
                    Some(pairs) => serde_json::json!({ "diverging": pairs }),
                    None => serde_json::Value::Null,
                },
            }),
        };
        match serde_json::to_string_pretty(&response) {
            Ok(text) => eprintln!("{}", text),
            Err(_) => eprintln!("error: {}", err),
        }
    } else {
        eprintln!("error: {}", err);
        if let Some(serde_json::Value::Array(pairs)) = divergence {
            eprintln!();
            eprintln!("Diverging:");
            for pair in pairs {
                eprintln!(
                    "  - {} {}: expected {} actual {}",
                    pair["node"].as_str().unwrap_or("?"),
                    pair["doc"].as_str().unwrap_or("?"),
                    pair["expected"],
                    pair["actual"]
                );
            }
        }
    }
}

/// Print human-readable output (ignored in quiet mode)
pub fn print_human(cli: &Cli, msg: &str) {
    if !cli.json && !cli.quiet {
        println!("{}", msg);
    }
}

use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "guard-cli")]
#[command(about = "Management CLI for the pulse-guard admin API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "PULSE_GUARD_ADMIN_KEY", default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Overall status and per-service health
    Status,
    /// Circuit breaker states
    Breakers,
    /// Rate limiter tokens, windows and blocks
    Limiters,
    /// Guardrail chain metrics, error rate and actions
    Guardrails,
    /// Activate the global kill switch
    Kill {
        #[arg(short, long)]
        reason: String,
    },
    /// Reset the global kill switch, or one chain's with --chain
    Reset {
        #[arg(short, long)]
        chain: Option<String>,
    },
    /// Force a breaker open or closed, or reset it
    Breaker {
        service: String,
        #[arg(value_parser = ["open", "close", "reset"])]
        action: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );
    let base = cli.url.trim_end_matches('/');

    let request = match cli.command {
        Commands::Status => client.get(format!("{}/admin/status", base)),
        Commands::Breakers => client.get(format!("{}/admin/breakers", base)),
        Commands::Limiters => client.get(format!("{}/admin/limiters", base)),
        Commands::Guardrails => client.get(format!("{}/admin/guardrails", base)),
        Commands::Kill { reason } => client
            .post(format!("{}/admin/kill-switch", base))
            .json(&json!({ "reason": reason })),
        Commands::Reset { chain } => client
            .post(format!("{}/admin/kill-switch/reset", base))
            .json(&json!({ "chain": chain })),
        Commands::Breaker { service, action } => {
            client.post(format!("{}/admin/breakers/{}/{}", base, service, action))
        }
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            if !text.is_empty() {
                eprintln!("Response: {}", text);
            }
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

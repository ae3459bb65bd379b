use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use quiz_runner::{AnswerClient, Config, StepController, face, hands};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "quiz-runner")]
#[command(about = "Solves multi-step web quizzes with a language model", long_about = None)]
struct Args {
    /// Address to serve the quiz endpoint on
    #[arg(long, env = "QUIZ_BIND", default_value = "127.0.0.1:3000")]
    bind: String,

    /// Use the hardened browser launch for deployed environments
    #[arg(long)]
    production: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quiz_runner=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = Config::from_env();
    config.production |= args.production;

    // Missing credentials are reported per request, not at startup.
    if config.secret.is_none() {
        warn!("QUIZ_SECRET is not set; every request will be rejected");
    }
    if config.model_token.is_none() {
        warn!("MODEL_API_TOKEN is not set; sessions cannot reach the model");
    }

    let config = Arc::new(config);
    let browser = hands::select_backend(&config);
    let answers = Arc::new(AnswerClient::new(&config));
    info!(backend = browser.name(), model = %config.model, "starting");

    let controller = Arc::new(StepController::new(config, browser, answers));

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!("quiz endpoint at http://{}/api/quiz", listener.local_addr()?);

    axum::serve(listener, face::router(controller)).await?;
    Ok(())
}

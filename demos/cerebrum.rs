use argh::FromArgs;
use cerebrum::{
    CerebrumPipeline, ClassifierCell, ExplanationClient, ExplanationConfig,
    server::{self, AppState},
};
use std::path::PathBuf;

// defaults for the server
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MODEL: &str = "brain_model.onnx";

#[derive(FromArgs)]
/// Cerebrum classifies brain MRI scans and explains the result.
struct CerebrumArgs {
    /// the host to run the server on
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to run the server on
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// path to the ONNX classifier
    #[argh(option, short = 'm', default = "PathBuf::from(DEFAULT_MODEL)")]
    model: PathBuf,

    /// override the explanation service endpoint
    #[argh(option)]
    endpoint: Option<String>,

    /// do not let the explanation service use web search
    #[argh(switch)]
    no_search: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: CerebrumArgs = argh::from_env();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    let mut config = ExplanationConfig::from_env();
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    config.google_search = !args.no_search;
    if config.api_key.is_none() {
        log::error!("GEMINI_API_KEY is not set, explanations will fall back to a fixed message");
    }
    let explainer = ExplanationClient::new(config)?;

    let pipeline = CerebrumPipeline::new(ClassifierCell::onnx(args.model));
    if let Err(e) = pipeline.warm_up() {
        log::error!("{}; scans will be refused", e);
    }

    let app = server::router(AppState::new(pipeline, explainer));

    log::info!("🚀 Starting the server");
    log::info!("🔥 Listening on: {}", addr);
    log::info!("🔧 Press Ctrl+C to stop the server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

use argh::FromArgs;
use cerebrum::ImageMime;
use reqwest::header::CONTENT_TYPE;
use std::path::PathBuf;

// defaults for the client
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 3000;

#[derive(FromArgs)]
/// Cerebrum client for uploading scans and chatting about them
struct ClientArgs {
    /// the host to connect to
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to connect to
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// command to execute: "session", "analyze", "chat" or "show"
    #[argh(subcommand)]
    command: ClientCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum ClientCommands {
    Session(SessionCommand),
    Analyze(AnalyzeCommand),
    Chat(ChatCommand),
    Show(ShowCommand),
}

#[derive(FromArgs)]
/// Open a new session
#[argh(subcommand, name = "session")]
struct SessionCommand {}

#[derive(FromArgs)]
/// Upload a scan for classification
#[argh(subcommand, name = "analyze")]
struct AnalyzeCommand {
    /// the session to use
    #[argh(option, short = 's')]
    session: u64,

    /// the path to the image
    #[argh(option, short = 'i')]
    image_path: PathBuf,
}

#[derive(FromArgs)]
/// Ask a question, either typed or picked from the suggestions
#[argh(subcommand, name = "chat")]
struct ChatCommand {
    /// the session to use
    #[argh(option, short = 's')]
    session: u64,

    /// the question to ask
    #[argh(option, short = 'q')]
    prompt: Option<String>,

    /// index of a suggested question
    #[argh(option, short = 'n')]
    suggestion: Option<usize>,
}

#[derive(FromArgs)]
/// Print the state and history of a session
#[argh(subcommand, name = "show")]
struct ShowCommand {
    /// the session to show
    #[argh(option, short = 's')]
    session: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: ClientArgs = argh::from_env();

    let client = reqwest::Client::new();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    let response = match args.command {
        ClientCommands::Session(_) => {
            client
                .post(format!("http://{}/sessions", addr))
                .send()
                .await?
        }
        ClientCommands::Analyze(command) => {
            let extension = command
                .image_path
                .extension()
                .and_then(|ext| ext.to_str())
                .ok_or("Invalid file extension")?;
            let mime = ImageMime::from_extension(extension)?;
            let bytes = tokio::fs::read(&command.image_path).await?;

            client
                .post(format!("http://{}/sessions/{}/analyze", addr, command.session))
                .header(CONTENT_TYPE, mime.as_str())
                .body(bytes)
                .send()
                .await?
        }
        ClientCommands::Chat(command) => {
            client
                .post(format!("http://{}/sessions/{}/chat", addr, command.session))
                .json(&cerebrum::server::messages::ChatRequest {
                    prompt: command.prompt,
                    suggestion: command.suggestion,
                })
                .send()
                .await?
        }
        ClientCommands::Show(command) => {
            client
                .get(format!("http://{}/sessions/{}", addr, command.session))
                .send()
                .await?
        }
    };

    let status = response.status();
    let result = response.json::<serde_json::Value>().await?;

    // analyses carry a ready-made report, print it as-is
    if let Some(markdown) = result.get("markdown").and_then(|m| m.as_str()) {
        println!("{}", markdown);
    } else {
        println!("Result ({}): {}", status, serde_json::to_string_pretty(&result)?);
    }

    Ok(())
}

use argh::FromArgs;
use std::{
    io::{BufRead, Write},
    path::PathBuf,
    time::Duration,
};
use vision_chat::{
    ChatConfig, ModelDirectory, ModelMatch, OllamaClient, Role, SessionController, SessionState,
    UploadedImage, config::DEFAULT_SERVER_URL,
};

// defaults for the client
const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(FromArgs)]
/// Terminal chat about images with a local multimodal model
struct ChatArgs {
    /// base url of the inference server
    #[argh(option, default = "DEFAULT_SERVER_URL.to_string()")]
    ollama: String,

    /// request timeout in seconds
    #[argh(option, default = "DEFAULT_TIMEOUT_SECS")]
    timeout: u64,

    /// only accept model names that exactly match the server listing
    #[argh(switch)]
    exact: bool,

    /// command to execute: "models" or "ask"
    #[argh(subcommand)]
    command: ChatCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum ChatCommands {
    Models(ModelsCommand),
    Ask(AskCommand),
}

#[derive(FromArgs)]
/// List the models available on the inference server
#[argh(subcommand, name = "models")]
struct ModelsCommand {}

#[derive(FromArgs)]
/// Ask questions about up to seven images
#[argh(subcommand, name = "ask")]
struct AskCommand {
    /// the model to use, defaults to the first listed one
    #[argh(option, short = 'm')]
    model: Option<String>,

    /// path to an image, repeat for more
    #[argh(option, short = 'i')]
    image: Vec<PathBuf>,

    /// a single question; without it questions are read from stdin
    #[argh(option, short = 'q')]
    question: Option<String>,

    /// number of answers to cache, 0 disables the cache
    #[argh(option, default = "0")]
    cache: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: ChatArgs = argh::from_env();

    let mut config = ChatConfig::default()
        .with_server_url(args.ollama)
        .with_request_timeout(Duration::from_secs(args.timeout))
        .with_model_match(if args.exact {
            ModelMatch::Exact
        } else {
            ModelMatch::Substring
        });

    let directory = OllamaClient::new(&config)?;

    match args.command {
        ChatCommands::Models(_) => {
            for model in directory.tags()? {
                match model.size {
                    Some(size) => println!("{}\t{:.1} GB", model.name, size as f64 / 1e9),
                    None => println!("{}", model.name),
                }
            }
        }
        ChatCommands::Ask(ask) => {
            config = config.with_cache_capacity(ask.cache);
            let controller =
                SessionController::new(vision_chat::dispatcher_from_config(&config)?, directory)
                    .with_max_images(config.max_images);

            let mut state = SessionState::new();

            let model = match ask.model {
                Some(model) => model,
                None => controller
                    .directory()
                    .list_models()?
                    .into_iter()
                    .next()
                    .map(|model| model.to_string())
                    .ok_or("the inference server has no models")?,
            };
            controller.set_model(&mut state, model)?;

            let files = ask
                .image
                .iter()
                .map(UploadedImage::from_path)
                .collect::<Result<Vec<_>, _>>()?;
            let count = controller.set_images(&mut state, &files)?;
            eprintln!(
                "Chatting with {} about {} image(s)",
                state.model().map(|m| m.as_str()).unwrap_or_default(),
                count
            );

            if let Some(question) = ask.question {
                println!("{}", controller.submit_question(&mut state, &question)?);
                return Ok(());
            }

            let stdin = std::io::stdin();
            loop {
                print!("> ");
                std::io::stdout().flush()?;

                let mut line = String::new();
                if stdin.lock().read_line(&mut line)? == 0 {
                    break;
                }
                if line.trim().is_empty() {
                    continue;
                }

                // failures end the question, not the chat
                match controller.submit_question(&mut state, &line) {
                    Ok(answer) => println!("{}\n", answer),
                    Err(e) => eprintln!("error: {}\n", e),
                }
            }

            let answered = state
                .transcript()
                .iter()
                .filter(|turn| turn.role == Role::Assistant)
                .count();
            eprintln!("{} question(s) answered", answered);
        }
    }

    Ok(())
}

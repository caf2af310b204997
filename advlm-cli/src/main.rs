use std::path::PathBuf;

use advlm::{BackendConfig, BackendKind, CommandResolver, ResolverMode};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use wordtok::Dictionary;

#[derive(Parser, Debug)]
#[command(author, version, about = "Resolve free-form adventure game input with a language model", long_about = None)]
struct Args {
    /// Backend config JSON file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend: local, quantized or remote (overrides the config file)
    #[arg(long, global = true)]
    backend: Option<BackendKind>,

    /// Model directory, Hugging Face repo id or GGUF file
    #[arg(long, global = true)]
    model: Option<String>,

    /// Resolver mode: disabled, extraction or semantic
    #[arg(long, global = true)]
    mode: Option<ResolverMode>,

    /// Game word dictionary (WORDS.TOK)
    #[arg(long, global = true)]
    dictionary: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print dictionary entries as `id<TAB>word`
    Words {
        /// Stop after this many entries
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print the vocabulary hint given to the model
    Hint {
        #[arg(long, default_value_t = 50)]
        max: usize,
    },
    /// Rewrite input as canonical English
    Extract { input: String },
    /// Ask whether input means an expected command; prints yes or no
    Match {
        input: String,
        /// Expected word ids, comma separated (needs --dictionary)
        #[arg(long, value_delimiter = ',', required_unless_present = "words", conflicts_with = "words")]
        ids: Vec<u16>,
        /// Expected words, space separated
        #[arg(long)]
        words: Option<String>,
    },
    /// Retell the game's text in the player's language
    Respond {
        #[arg(long)]
        game_text: String,
        #[arg(long)]
        player_input: Option<String>,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .format_timestamp(None)
        .init();

    let dictionary = match &args.dictionary {
        Some(path) => Some(
            wordtok::read_file(path)
                .with_context(|| format!("Failed to read dictionary {}", path.display()))?,
        ),
        None => None,
    };

    match &args.command {
        Command::Words { limit } => {
            let dict = open_dictionary(dictionary.as_deref())?;
            for entry in dict.entries().take(limit.unwrap_or(usize::MAX)) {
                println!("{}\t{}", entry.id, entry.word);
            }
            Ok(())
        }
        Command::Hint { max } => {
            let dict = open_dictionary(dictionary.as_deref())?;
            println!("{}", dict.sample_common_words(*max));
            Ok(())
        }
        command => {
            let config = load_config(&args)?;
            run_resolver(config, dictionary.as_deref(), command)
        }
    }
}

fn open_dictionary(data: Option<&[u8]>) -> Result<Dictionary<'_>> {
    let Some(data) = data else {
        bail!("--dictionary is required for this command");
    };
    let dict = Dictionary::new(data).context("Invalid dictionary")?;
    log::info!("Dictionary: {} entries", dict.len());
    Ok(dict)
}

/// Config file (or backend defaults) with command-line overrides applied.
fn load_config(args: &Args) -> Result<BackendConfig> {
    let mut config = match &args.config {
        Some(path) => BackendConfig::from_json_file(path)?,
        None => BackendConfig::for_backend(args.backend.unwrap_or_default()),
    };
    if let Some(kind) = args.backend {
        if kind != config.backend {
            // Switching backends takes that backend's defaults for anything the
            // file did not pin down.
            config = BackendConfig {
                mode: config.mode,
                credential: config.credential.clone(),
                verbose: config.verbose,
                ..BackendConfig::for_backend(kind)
            };
        }
    }
    if let Some(model) = &args.model {
        match config.backend {
            BackendKind::Remote => config.model_identifier = model.clone(),
            _ => config.model_path = model.clone(),
        }
    }
    match args.mode {
        Some(mode) => config.mode = mode,
        // Matching needs semantic mode.
        None if matches!(args.command, Command::Match { .. }) => config.mode = ResolverMode::Semantic,
        None => {}
    }
    Ok(config)
}

fn run_resolver(config: BackendConfig, dictionary: Option<&[u8]>, command: &Command) -> Result<()> {
    let mut resolver = CommandResolver::from_config(&config)
        .with_context(|| format!("Failed to initialize {} backend", config.backend))?;
    if let Some(data) = dictionary {
        resolver.set_dictionary(data).context("Invalid dictionary")?;
    }

    match command {
        Command::Extract { input } => println!("{}", resolver.extract_words(input)),
        Command::Match { input, ids, words } => {
            let matched = match words {
                Some(words) => {
                    let words: Vec<String> = words.split_whitespace().map(str::to_string).collect();
                    resolver.matches_words(input, &words)
                }
                None => {
                    if resolver.dictionary().is_none() {
                        bail!("--ids needs --dictionary");
                    }
                    resolver.matches_expected(input, ids)
                }
            };
            println!("{}", if matched { "yes" } else { "no" });
        }
        Command::Respond {
            game_text,
            player_input,
        } => {
            let player_input = player_input.as_deref().unwrap_or_default();
            if !player_input.is_empty() {
                resolver.context_mut().on_player_input(player_input);
            }
            let text = resolver
                .generate_response(game_text, player_input)
                .unwrap_or_else(|| game_text.clone());
            println!("{text}");
        }
        Command::Words { .. } | Command::Hint { .. } => bail!("{command:?} does not use a backend"),
    }

    resolver.shutdown();
    Ok(())
}

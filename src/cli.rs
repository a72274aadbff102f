use std::cmp;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use mdict_render::{Rendered, RenderedPage, Renderer, SourceRegistry};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mdict-render", about = "Render dictionary entries", version)]
pub struct Cli {
    /// Emit JSON instead of plain HTML/text.
    #[arg(long, global = true)]
    json: bool,

    /// Dictionary directory to load; repeat for several dictionaries.
    #[arg(long = "dict", global = true)]
    dictionaries: Vec<PathBuf>,

    /// Externally reachable root used for lite-mode URLs.
    #[arg(long, global = true, default_value = "http://127.0.0.1:8080")]
    base_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a word.
    Lookup {
        word: String,
        #[arg(long, value_enum, default_value_t = ModeArg::Aggregate)]
        mode: ModeArg,
        /// Dictionary id for single mode, or the lite selector (`default`, `all`, an id).
        #[arg(long, default_value = "default")]
        source: String,
        /// Extra dictionaries tried in lite mode, comma separated.
        #[arg(long, value_delimiter = ',')]
        fallback: Vec<String>,
        /// Keep going after the first lite hit.
        #[arg(long)]
        all_results: bool,
    },
    /// List headwords that start with the provided prefix.
    Suggest {
        part: String,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Describe the loaded dictionaries.
    List,
    /// Run the HTTP server.
    #[cfg(feature = "web")]
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: std::net::SocketAddr,
        /// JSON-lines file for the lookup history; kept in memory when omitted.
        #[arg(long)]
        history: Option<PathBuf>,
        /// Disable the resource cache.
        #[arg(long)]
        no_cache: bool,
        #[arg(long, default_value_t = mdict_render::resource::DEFAULT_CACHE_CAPACITY)]
        cache_capacity: usize,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Single,
    Aggregate,
    Lite,
}

pub fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing();
    match cli.command {
        Command::Lookup {
            ref word,
            mode,
            ref source,
            ref fallback,
            all_results,
        } => {
            let renderer = load_renderer(&cli)?;
            let rendered = match mode {
                ModeArg::Aggregate => Rendered::Page(renderer.render_aggregate(word)?),
                ModeArg::Single => {
                    let id = match source.as_str() {
                        "default" => renderer
                            .registry()
                            .first()
                            .map(|first| first.id.clone())
                            .ok_or("No dictionaries loaded")?,
                        id => id.to_string(),
                    };
                    renderer.render_single(&id, word)?
                }
                ModeArg::Lite => renderer.render_lite(source, word, fallback, all_results)?,
            };
            print_rendered(&rendered, cli.json)
        }
        Command::Suggest { ref part, limit } => {
            let renderer = load_renderer(&cli)?;
            let limit = cmp::max(1, limit);
            let words = renderer.suggest(part, limit);
            if cli.json {
                let payload = json!({ "part": part, "suggestion": words });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else if words.is_empty() {
                println!("No headwords start with \"{part}\".");
            } else {
                for word in words {
                    println!("{word}");
                }
            }
            Ok(())
        }
        Command::List => {
            let renderer = load_renderer(&cli)?;
            let listing = renderer.list(None);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&listing)?);
                return Ok(());
            }
            let width = listing
                .iter()
                .map(|item| item.uuid.len())
                .max()
                .unwrap_or(2)
                .max("ID".len());
            println!("{:<width$}  {}", "ID", "TITLE", width = width);
            println!("{:-<width$}  {}", "", "-----", width = width);
            for item in &listing {
                println!("{:<width$}  {}", item.uuid, item.title, width = width);
            }
            Ok(())
        }
        #[cfg(feature = "web")]
        Command::Serve {
            addr,
            history,
            no_cache,
            cache_capacity,
        } => {
            let config = mdict_render::web::WebConfig {
                addr,
                base_url: cli.base_url,
                dictionaries: cli.dictionaries,
                history_path: history,
                cache_capacity: (!no_cache).then_some(cache_capacity),
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(mdict_render::web::serve(config))?;
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_renderer(cli: &Cli) -> Result<Renderer, Box<dyn Error>> {
    if cli.dictionaries.is_empty() {
        return Err("Pass at least one dictionary directory with --dict".into());
    }
    let registry = SourceRegistry::from_dirs(&cli.dictionaries)?;
    Ok(Renderer::new(Arc::new(registry), cli.base_url.as_str()))
}

fn print_rendered(rendered: &Rendered, as_json: bool) -> Result<(), Box<dyn Error>> {
    match rendered {
        Rendered::Redirect(target) => {
            if as_json {
                let payload = json!({ "redirect": target });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                let anchor = target
                    .anchor
                    .as_deref()
                    .map(|anchor| format!("#{anchor}"))
                    .unwrap_or_default();
                println!(
                    "Redirect: {} in {}{}",
                    target.target_word, target.source_id, anchor
                );
            }
        }
        Rendered::Page(page) => {
            if as_json {
                println!("{}", serde_json::to_string_pretty(page)?);
            } else {
                print_page(page);
            }
        }
    }
    Ok(())
}

fn print_page(page: &RenderedPage) {
    if page.sections.is_empty() {
        println!("No entries found for \"{}\".", page.word);
        return;
    }
    if page.mode == mdict_render::RenderMode::Lite {
        println!("{}", page.lite_html());
        return;
    }
    for section in &page.sections {
        println!("<!-- {} ({}) -->", section.title, section.source_id);
        println!("{}", section.body_html);
    }
}

use anyhow::{bail, Context, Result};
use playlists::config::CONFIG_FILE;
use playlists::{Config, PlaylistService};
use std::path::PathBuf;
use tracing::info;

const USAGE: &str = "\
usage: tapeswarm [--config PATH] <command>

commands:
  serve                      run the seeding policy until ctrl-c
  create NAME FILE...        bundle FILEs into a new playlist
  import BUNDLE              add a playlist from a bundle descriptor
  list                       print the stored playlists
  export ID DEST             copy a playlist's bundle descriptor to DEST
  play ID                    seed or stream a playlist and mark it played
  pin ID | unpin ID          toggle permanent seeding
  delete ID                  stop and remove a playlist";

fn load_config(explicit: Option<PathBuf>) -> Result<Config> {
    let path = match explicit {
        Some(path) => path,
        None => Config::default().data_root.join(CONFIG_FILE),
    };
    Config::load(&path).with_context(|| format!("loading {}", path.display()))
}

fn arg(args: &[String], index: usize, what: &str) -> Result<String> {
    match args.get(index) {
        Some(value) => Ok(value.clone()),
        None => bail!("missing {}\n\n{}", what, USAGE),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path = None;
    if args.first().map(String::as_str) == Some("--config") {
        config_path = Some(PathBuf::from(arg(&args, 1, "config path")?));
        args.drain(..2);
    }

    let config = load_config(config_path)?;
    let command = arg(&args, 0, "command")?;

    if command == "serve" {
        playlists::run(config).await?;
        return Ok(());
    }

    // Sessions belong to `serve`; this process only edits the shared store
    tracing_subscriber::fmt::try_init().ok();
    let service = playlists::open_detached_service(&config)?;
    dispatch(&service, &command, &args[1..]).await
}

async fn dispatch(service: &PlaylistService, command: &str, args: &[String]) -> Result<()> {
    match command {
        "create" => {
            let name = arg(args, 0, "playlist name")?;
            let files: Vec<PathBuf> = args[1..].iter().map(PathBuf::from).collect();
            if files.is_empty() {
                bail!("no files given\n\n{}", USAGE);
            }
            let playlist = service.create_playlist(&name, "", &files).await?;
            println!("{}", playlist.id);
        }
        "import" => {
            let path = PathBuf::from(arg(args, 0, "bundle path")?);
            let playlist = service.import_bundle(&path).await?;
            println!("{}", playlist.id);
        }
        "list" => {
            let playlists = service.playlists().await?;
            println!("{}", serde_json::to_string_pretty(&playlists)?);
        }
        "export" => {
            let id = arg(args, 0, "playlist id")?;
            let dest = PathBuf::from(arg(args, 1, "destination")?);
            service.export_bundle(&id, &dest).await?;
        }
        "play" => {
            let id = arg(args, 0, "playlist id")?;
            let outcome = service.play(&id).await?;
            info!("Marked {} as played ({:?})", id, outcome);
        }
        "pin" | "unpin" => {
            let id = arg(args, 0, "playlist id")?;
            service.set_permanent_seeding(&id, command == "pin").await?;
        }
        "delete" => {
            let id = arg(args, 0, "playlist id")?;
            service.delete_playlist(&id).await?;
        }
        other => bail!("unknown command '{}'\n\n{}", other, USAGE),
    }
    Ok(())
}

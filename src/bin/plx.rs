//! plx - PocketLinx CLI
//!
//! Thin command-line front end over the engine. One subcommand per
//! engine operation:
//!
//! ```sh
//! plx setup
//! plx pull alpine
//! plx run [-d] [--name web] [-p 8080:80] [-v data:/srv] <image> [cmd…]
//! plx ps | logs <id> | exec <id> <cmd…> | stop <id> | rm <id>
//! plx build <ctx> [-f Dockerfile] [-t tag]
//! plx diff <a> <b> | plx package <base> <target> <out.tgz>
//! plx volume create|ls|rm [name]
//! ```

use pocketlinx::{Engine, EngineConfig, Mount, PortMapping, RunOptions};
use std::process::ExitCode;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Setup,
    Install,
    Pull { image: String },
    Images,
    Diff { a: String, b: String },
    Package { base: String, target: String, out: String },
    Build { ctx: String, dockerfile: String, tag: String },
    Run(RunOptions),
    Start { id: String },
    Stop { id: String },
    Logs { id: String },
    Ps,
    Rm { id: String },
    Exec { id: String, cmd: Vec<String>, interactive: bool },
    Update { id: String, opts: RunOptions },
    Prune,
    VolumeCreate { name: String },
    VolumeLs,
    VolumeRm { name: String },
    Version,
    Help,
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let Some(cmd) = args.first() else {
        return Ok(Command::Help);
    };

    let need = |n: usize, what: &str| -> Result<(), String> {
        if args.len() < n + 1 {
            Err(format!("{} required", what))
        } else {
            Ok(())
        }
    };

    match cmd.as_str() {
        "setup" => Ok(Command::Setup),
        "install" => Ok(Command::Install),
        "pull" => {
            need(1, "image name")?;
            Ok(Command::Pull { image: args[1].clone() })
        }
        "images" => Ok(Command::Images),
        "diff" => {
            need(2, "two image names")?;
            Ok(Command::Diff { a: args[1].clone(), b: args[2].clone() })
        }
        "package" => {
            need(3, "base, target and output path")?;
            Ok(Command::Package {
                base: args[1].clone(),
                target: args[2].clone(),
                out: args[3].clone(),
            })
        }
        "build" => {
            need(1, "context directory")?;
            let ctx = args[1].clone();
            let mut dockerfile = String::new();
            let mut tag = String::new();
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "-f" | "--file" if i + 1 < args.len() => {
                        dockerfile = args[i + 1].clone();
                        i += 2;
                    }
                    "-t" | "--tag" if i + 1 < args.len() => {
                        tag = args[i + 1].clone();
                        i += 2;
                    }
                    other => return Err(format!("unknown build flag: {}", other)),
                }
            }
            Ok(Command::Build { ctx, dockerfile, tag })
        }
        "run" => Ok(Command::Run(parse_run_options(&args[1..])?)),
        "start" => {
            need(1, "container id")?;
            Ok(Command::Start { id: args[1].clone() })
        }
        "stop" => {
            need(1, "container id")?;
            Ok(Command::Stop { id: args[1].clone() })
        }
        "logs" => {
            need(1, "container id")?;
            Ok(Command::Logs { id: args[1].clone() })
        }
        "ps" => Ok(Command::Ps),
        "rm" => {
            need(1, "container id")?;
            Ok(Command::Rm { id: args[1].clone() })
        }
        "exec" => {
            let mut rest: Vec<String> = args[1..].to_vec();
            let mut interactive = false;
            rest.retain(|a| {
                if a == "-it" || a == "-i" || a == "--interactive" {
                    interactive = true;
                    false
                } else {
                    true
                }
            });
            if rest.len() < 2 {
                return Err("exec requires <container> <cmd…>".to_string());
            }
            Ok(Command::Exec {
                id: rest[0].clone(),
                cmd: rest[1..].to_vec(),
                interactive,
            })
        }
        "update" => {
            need(1, "container id")?;
            let opts = parse_run_options(&args[2..])?;
            Ok(Command::Update { id: args[1].clone(), opts })
        }
        "prune" => Ok(Command::Prune),
        "volume" => match args.get(1).map(String::as_str) {
            Some("create") => {
                need(2, "volume name")?;
                Ok(Command::VolumeCreate { name: args[2].clone() })
            }
            Some("ls") => Ok(Command::VolumeLs),
            Some("rm") => {
                need(2, "volume name")?;
                Ok(Command::VolumeRm { name: args[2].clone() })
            }
            _ => Err("volume requires create|ls|rm".to_string()),
        },
        "version" | "--version" | "-V" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(format!("unknown command: {}", other)),
    }
}

/// Parses `run`/`update` flags. The first bare word is the image;
/// everything after it is the container command.
fn parse_run_options(args: &[String]) -> Result<RunOptions, String> {
    let mut opts = RunOptions::default();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "--name" if i + 1 < args.len() => {
                opts.name = args[i + 1].clone();
                i += 2;
            }
            "-v" | "--volume" if i + 1 < args.len() => {
                let (src, dst) = split_pair(&args[i + 1], "mount")?;
                opts.mounts.push(Mount::new(src, dst));
                i += 2;
            }
            "-e" | "--env" if i + 1 < args.len() => {
                let (k, v) = args[i + 1]
                    .split_once('=')
                    .ok_or_else(|| format!("bad env entry: {}", args[i + 1]))?;
                opts.env.insert(k.to_string(), v.to_string());
                i += 2;
            }
            "-p" | "--port" if i + 1 < args.len() => {
                let (host, container) = split_pair(&args[i + 1], "port")?;
                let host: u16 = host.parse().map_err(|_| format!("bad port: {}", host))?;
                let container: u16 = container
                    .parse()
                    .map_err(|_| format!("bad port: {}", container))?;
                opts.ports.push(PortMapping::new(host, container));
                i += 2;
            }
            "--user" | "-u" if i + 1 < args.len() => {
                opts.user = args[i + 1].clone();
                i += 2;
            }
            "--workdir" | "-w" if i + 1 < args.len() => {
                opts.workdir = args[i + 1].clone();
                i += 2;
            }
            "--add-host" if i + 1 < args.len() => {
                opts.extra_hosts.push(args[i + 1].clone());
                i += 2;
            }
            "-it" | "-i" | "--interactive" => {
                opts.interactive = true;
                i += 1;
            }
            "-d" | "--detach" => {
                opts.detach = true;
                i += 1;
            }
            flag if flag.starts_with('-') => {
                return Err(format!("unknown run flag: {}", flag));
            }
            _ => {
                opts.image = args[i].clone();
                opts.args = args[i + 1..].to_vec();
                break;
            }
        }
    }

    Ok(opts)
}

fn split_pair<'a>(s: &'a str, what: &str) -> Result<(&'a str, &'a str), String> {
    // Split on the LAST colon so Windows drive letters survive
    // ("C:\data:/srv" → "C:\data", "/srv").
    s.rsplit_once(':')
        .filter(|(a, b)| !a.is_empty() && !b.is_empty())
        .ok_or_else(|| format!("bad {} (expected src:dst): {}", what, s))
}

fn print_help() {
    println!(
        "plx {VERSION} - portable single-binary container runtime

USAGE:
  plx <command> [args]

COMMANDS:
  setup                          provision the engine environment
  install                        copy this binary into the data dir
  pull <image>                   fetch an image tarball
  images                         list images
  diff <a> <b>                   list file differences between images
  package <base> <target> <out>  export files(target) \\ files(base)
  build <ctx> [-f file] [-t tag] build an image from a Dockerfile
  run [flags] <image> [cmd…]     create and start a container
  start|stop|rm <id>             lifecycle of an existing container
  logs <id>                      print the detached console log
  ps                             list containers
  exec [-it] <id> <cmd…>         run a command inside a container
  update <id> [flags…]           apply new options to a container
  prune                          drop all build cache layers
  volume create|ls|rm [name]     named volume management

RUN FLAGS:
  --name <n>  -v src:dst  -e K=V  -p host:cont  -u user  -w dir
  --add-host name:ip  -it  -d

A -v source with no '/', '\\' or '.' is a named volume; anything else
is a host path bind mount."
    );
}

// =============================================================================
// Main
// =============================================================================

async fn dispatch(cmd: Command) -> pocketlinx::Result<()> {
    let engine = Engine::auto(EngineConfig::default()).await?;

    match cmd {
        Command::Setup => engine.setup().await,
        Command::Install => engine.install().await,
        Command::Pull { image } => engine.pull(&image).await,
        Command::Images => {
            for name in engine.images().await? {
                println!("{}", name);
            }
            Ok(())
        }
        Command::Diff { a, b } => {
            print!("{}", engine.diff(&a, &b).await?);
            Ok(())
        }
        Command::Package { base, target, out } => engine.package(&base, &target, &out).await,
        Command::Build { ctx, dockerfile, tag } => {
            let image = engine
                .build(std::path::Path::new(&ctx), &dockerfile, &tag)
                .await?;
            println!("Successfully built image '{}'", image);
            Ok(())
        }
        Command::Run(opts) => {
            let id = engine.run(opts).await?;
            println!("{}", id);
            Ok(())
        }
        Command::Start { id } => engine.start(&id).await,
        Command::Stop { id } => engine.stop(&id).await,
        Command::Logs { id } => {
            print!("{}", engine.logs(&id).await?);
            Ok(())
        }
        Command::Ps => {
            for c in engine.ps().await? {
                let ports: Vec<String> = c.ports.iter().map(|p| p.to_string()).collect();
                println!(
                    "{}  {}  {}  {}  {}  {}",
                    c.id,
                    if c.name.is_empty() { "-" } else { &c.name },
                    c.image,
                    c.status,
                    if c.ip.is_empty() { "-" } else { &c.ip },
                    if ports.is_empty() { "-".to_string() } else { ports.join(",") },
                );
            }
            Ok(())
        }
        Command::Rm { id } => engine.rm(&id).await,
        Command::Exec { id, cmd, interactive } => {
            let out = engine.exec(&id, &cmd, interactive).await?;
            print!("{}", out);
            Ok(())
        }
        Command::Update { id, opts } => engine.update(&id, opts).await,
        Command::Prune => engine.prune().await,
        Command::VolumeCreate { name } => engine.volume_create(&name).await,
        Command::VolumeLs => {
            for name in engine.volume_ls().await? {
                println!("{}", name);
            }
            Ok(())
        }
        Command::VolumeRm { name } => engine.volume_rm(&name).await,
        Command::Version | Command::Help => unreachable!("handled before engine construction"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cmd = match parse_args(&args) {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Run 'plx help' for usage.");
            return ExitCode::FAILURE;
        }
    };

    match cmd {
        Command::Version => {
            println!("plx {}", VERSION);
            ExitCode::SUCCESS
        }
        Command::Help => {
            print_help();
            ExitCode::SUCCESS
        }
        other => match dispatch(other).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        },
    }
}

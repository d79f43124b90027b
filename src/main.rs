//! Filegate CLI
//!
//! Runs the server or acts as a client against one.

use clap::Parser;
use filegate::client::Session;
use filegate::config::{ClientArgs, CliArgs, Commands, LogFormat, ServerSettings};
use filegate::error::Result;
use filegate::progress::TransferProgress;
use filegate::rpc::RpcValue;
use filegate::server::{builtin_methods, HttpServer};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() {
    // Parse CLI arguments
    let args = CliArgs::parse();

    init_logging(&args);

    // Handle result
    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(args: &CliArgs) {
    let default = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match args.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn run(args: CliArgs) -> Result<()> {
    let quiet = args.quiet;
    match args.command {
        Commands::Serve { config, bind } => cmd_serve(&config, bind),
        Commands::Call {
            client,
            method,
            args,
        } => cmd_call(&client, &method, &args),
        Commands::Upload {
            client,
            local,
            remote,
        } => cmd_upload(&client, &local, &remote, quiet),
        Commands::Download {
            client,
            remote,
            local,
        } => cmd_download(&client, &remote, &local, quiet),
        Commands::Version { client } => {
            let mut session = connect(&client)?;
            println!("{}", session.remote_version()?);
            Ok(())
        }
        Commands::Exists { client, remote } => {
            let mut session = connect(&client)?;
            let exists = session.exists(&remote)?;
            println!("{}", exists);
            if !exists {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Delete { client, remote } => {
            let mut session = connect(&client)?;
            println!("{}", session.delete(&remote)?);
            Ok(())
        }
        Commands::Ls { client, remote } => {
            let mut session = connect(&client)?;
            for name in session.list_files(&remote)? {
                println!("{}", name);
            }
            Ok(())
        }
    }
}

fn connect(client: &ClientArgs) -> Result<Session> {
    Session::establish(&client.url, client.credentials()?, client.session_options()?)
}

fn cmd_serve(config: &Path, bind: Option<SocketAddr>) -> Result<()> {
    let settings = ServerSettings::load(config)?;
    let mut http = settings.http_config()?;
    if let Some(bind) = bind {
        http.bind = bind;
    }

    std::fs::create_dir_all(&settings.root)
        .map_err(|e| filegate::FilegateError::io(&settings.root, e))?;
    let dispatcher = settings.dispatcher(builtin_methods())?;
    tracing::info!(
        "Serving {} with methods {:?}",
        settings.root.display(),
        dispatcher.methods().names()
    );

    HttpServer::bind(http, Arc::new(dispatcher))?.run()
}

fn cmd_call(client: &ClientArgs, method: &str, args: &[String]) -> Result<()> {
    let args = args
        .iter()
        .map(|a| RpcValue::parse_typed(a))
        .collect::<Result<Vec<_>>>()?;

    let mut session = connect(client)?;
    println!("{}", session.call(method, &args)?);
    Ok(())
}

fn cmd_upload(client: &ClientArgs, local: &Path, remote: &str, quiet: bool) -> Result<()> {
    let mut session = connect(client)?;
    let progress = Arc::new(progress_for(client, quiet));
    session.set_listener(progress.clone());

    session.upload_file(local, remote)?;
    if !quiet {
        progress.summary().print();
    }
    Ok(())
}

fn cmd_download(client: &ClientArgs, remote: &str, local: &Path, quiet: bool) -> Result<()> {
    let mut session = connect(client)?;
    let progress = Arc::new(progress_for(client, quiet));
    session.set_listener(progress.clone());

    session.download_file(remote, local)?;
    if !quiet {
        progress.summary().print();
    }
    Ok(())
}

fn progress_for(client: &ClientArgs, quiet: bool) -> TransferProgress {
    if client.progress && !quiet {
        TransferProgress::new()
    } else {
        TransferProgress::disabled()
    }
}

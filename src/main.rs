use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use hotline::call::CallConfig;
use hotline::config::Settings;
use hotline::conversation::{Collaborators, Conversation, EndReason};
use hotline::proxy::{ProxyConfig, SipProxy};
use hotline::{logging, persona};

#[derive(Parser, Debug)]
#[command(name = "hotline", version, about = "Voice hotline over SIP/RTP")]
struct Cli {
    /// Settings file (JSON); defaults apply when absent
    #[arg(long, global = true, env = "HOTLINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ring the phone and hold a conversation
    Call {
        #[arg(long)]
        proxy: Option<SocketAddr>,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        persona: Option<String>,
    },
    /// Run the local SIP proxy/registrar
    Proxy {
        #[arg(long)]
        bind: Option<SocketAddr>,
        #[arg(long)]
        ata_ip: Option<IpAddr>,
    },
    /// Write the effective settings as JSON
    WriteConfig { path: PathBuf },
    /// List the available characters
    Personas,
}

fn load_settings(path: Option<&Path>) -> Result<Settings, hotline::error::ConfigError> {
    let mut settings = match path {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    settings.apply_env()?;
    Ok(settings)
}

async fn place_call(settings: Settings) -> ExitCode {
    let persona = persona::find_or_default(&settings.conversation.persona);
    let config = CallConfig {
        proxy_addr: settings.sip.proxy,
        local_ip: settings.local_ip(),
        sip_port: settings.sip.local_port,
        rtp_port: settings.media.rtp_port,
        target_user: settings.sip.target_user.clone(),
        caller_user: settings.sip.caller_user.clone(),
        invite_timeout: settings.sip.invite_timeout(),
        bye_timeout: settings.sip.bye_timeout(),
        call_id: None,
    };

    tracing::info!(
        "Calling {} via {} as {}",
        config.target_user,
        config.proxy_addr,
        persona.name
    );

    let mut conversation = Conversation::new(persona, &settings, Collaborators::offline());
    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Interrupted, ending call");
    };

    match conversation.run_until(config, interrupted).await {
        Ok(summary) if summary.ended_by == EndReason::MediaFailure => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Call failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_proxy(settings: Settings) -> ExitCode {
    let config = ProxyConfig {
        bind: settings.proxy.bind,
        ata_ip: settings.proxy.ata_ip,
    };
    let proxy = match SipProxy::bind(config).await {
        Ok(proxy) => proxy,
        Err(e) => {
            tracing::error!("Failed to bind proxy on {}: {}", settings.proxy.bind, e);
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = proxy.run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(_) => ExitCode::FAILURE,
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("[Proxy] Shutting down");
            ExitCode::SUCCESS
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut settings = match load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Invalid settings: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Call {
            proxy,
            target,
            persona,
        } => {
            if let Some(proxy) = proxy {
                settings.sip.proxy = proxy;
            }
            if let Some(target) = target {
                settings.sip.target_user = target;
            }
            if let Some(persona) = persona {
                settings.conversation.persona = persona;
            }
            let _guard = logging::init(&settings.log);
            place_call(settings).await
        }
        Command::Proxy { bind, ata_ip } => {
            if let Some(bind) = bind {
                settings.proxy.bind = bind;
            }
            if ata_ip.is_some() {
                settings.proxy.ata_ip = ata_ip;
            }
            let _guard = logging::init(&settings.log);
            run_proxy(settings).await
        }
        Command::WriteConfig { path } => match settings.save(&path) {
            Ok(()) => {
                println!("Wrote {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Could not write {}: {}", path.display(), e);
                ExitCode::FAILURE
            }
        },
        Command::Personas => {
            for p in persona::all() {
                println!("{:<12} {}", p.key, p.name);
            }
            ExitCode::SUCCESS
        }
    }
}

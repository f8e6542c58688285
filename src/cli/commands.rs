use anyhow::{Context, Result};
use tracing::info;

use crate::codec::AddressCodec;
use crate::pidfile::PidFile;
use crate::server::Gateway;

use super::args::ServeArgs;
use super::cert;
use super::config::{check_config, check_config_file_permissions};

/// Execute CLI commands
pub async fn execute_command(cli: super::Cli) -> Result<()> {
    use super::Commands;

    match cli.command {
        Commands::Serve(args) => {
            run_serve(args).await?;
        }
        Commands::Encrypt { secret, addr } => {
            println!("{}", AddressCodec::new(secret).encrypt(&addr));
        }
        Commands::Decrypt { secret, token } => {
            let plain = AddressCodec::new(secret)
                .decrypt(&token)
                .context("Failed to decrypt token")?;
            println!("{}", plain);
        }
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            cert::generate_certificate(&cert_out, &key_out, &common_name, &alt_names)?;
        }
        Commands::Check { config, format } => {
            check_config(&config, &format)?;
        }
    }

    Ok(())
}

/// Run the gateway until SIGINT/SIGTERM
async fn run_serve(args: ServeArgs) -> Result<()> {
    if let Some(path) = &args.config {
        check_config_file_permissions(path)?;
        info!("Loading gateway configuration from: {}", path.display());
    }

    let config = args.resolve()?;

    let pid_file = match &config.pid_file {
        Some(path) => Some(PidFile::create(path)?),
        None => None,
    };

    let gateway = Gateway::bind(config).await?;
    for line in gateway.banner(pid_file.as_ref().map(PidFile::pid)).lines() {
        info!("{}", line);
    }

    let result = gateway.run().await;
    drop(pid_file);
    result
}

//! Lottery center server executable.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use lottery_center::{
    logger_init, pf_error, pf_info, CancelToken, LotteryCenter, TallyError,
    ME,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening socket.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind_ip: IpAddr,

    /// Agency-facing port.
    #[arg(short, long, env = "SERVER_PORT", default_value_t = 12345)]
    port: u16,

    /// Listening socket backlog.
    #[arg(long, env = "SERVER_LISTEN_BACKLOG", default_value_t = 5)]
    backlog: u32,

    /// Number of agencies taking part in the draw.
    #[arg(short = 'n', long, env = "AGENCY_COUNT", default_value_t = 5)]
    agencies: u8,

    /// Server configuration parameters as a TOML string.
    #[arg(short, long)]
    config: Option<String>,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(bind_addr)` on success
    /// or `Err(TallyError)` on any error.
    fn sanitize(&self) -> Result<SocketAddr, TallyError> {
        if self.port <= 1024 {
            Err(TallyError::msg(format!("invalid port {}", self.port)))
        } else if self.backlog == 0 {
            Err(TallyError::msg(format!("invalid backlog {}", self.backlog)))
        } else if self.agencies == 0 {
            Err(TallyError::msg(format!(
                "invalid number of agencies {}",
                self.agencies
            )))
        } else {
            Ok(SocketAddr::new(self.bind_ip, self.port))
        }
    }
}

/// Actual main function of the lottery center server.
fn server_main() -> Result<bool, TallyError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let bind_addr = args.sanitize()?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;
    let cancel = CancelToken::from_receiver(rx_term);

    let log_level = log::max_level();
    let drawn = {
        // agencies are serviced strictly one at a time
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name("tokio-lottery-center")
            .build()?;

        runtime.block_on(async move {
            let center = LotteryCenter::new_and_setup(
                bind_addr,
                args.backlog,
                args.agencies,
                args.config.as_deref(),
                cancel,
            )
            .await?;

            let drawn = center.run().await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<bool, TallyError>(drawn) // give type hint for this async closure
        })?
    }; // drop the runtime here

    log::set_max_level(log_level);
    Ok(drawn)
}

/// Main function of the lottery center server.
fn main() -> ExitCode {
    logger_init();
    if ME.set("center".into()).is_err() {
        pf_error!("process identity already set");
    }

    match server_main() {
        Ok(drawn) => {
            pf_info!("server exited, draw performed: {}", drawn);
            ExitCode::SUCCESS
        }
        Err(ref e) => {
            pf_error!("server_main exited: {}", e);
            ExitCode::FAILURE
        }
    }
}

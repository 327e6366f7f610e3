//! Demultiplex streams that have been multiplexed by `tarmux`.

use clap::Parser;
use tarmux::DemuxCli;

fn main() {
    let cli = DemuxCli::parse();

    tarmux::init_logger(cli.verbose);

    match cli.run() {
        Ok(summary) => {
            log::debug!("tardemux exit, {:?}", summary);
        }
        Err(err) => {
            log::error!("tardemux exit with error: {}", err);
            std::process::exit(err.exit_code());
        }
    }
}

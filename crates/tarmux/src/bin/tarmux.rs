//! Multiplex files, pipes and standard input into a single tar stream.

use clap::Parser;
use tarmux::MuxCli;

fn main() {
    let cli = MuxCli::parse();

    tarmux::init_logger(cli.verbose);

    match cli.run() {
        Ok(summary) => {
            log::debug!("tarmux exit, {:?}", summary);
        }
        Err(err) => {
            log::error!("tarmux exit with error: {}", err);
            std::process::exit(err.exit_code());
        }
    }
}

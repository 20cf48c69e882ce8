mod app;
mod elf;
mod error;
mod guest;
mod kernel;
mod loader;
mod local_logger;
mod patch;
mod prelude;
mod process;
mod reloc;
mod report;
mod symbols;
mod validate;

use console::style;
use prelude::*;

use log::log_enabled;

fn main() {
    let res = crate::app::run();
    if let Err(err) = res {
        for cause in err.chain() {
            if log_enabled!(log::Level::Error) {
                error!("{} {}", style("Error:").bold().red(), style(cause).red());
            } else {
                eprintln!("Error: {cause}");
            }
        }
        if log_enabled!(log::Level::Debug) {
            for e in err.chain().skip(1) {
                debug!("Caused by: {}", e);
            }
        }

        std::process::exit(1);
    }
}

//! The easyrsa command line binary.

use easyrsa::cli;

fn main() {
    if let Err(err) = cli::run() {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

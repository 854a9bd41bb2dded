fn main() {
    if let Err(e) = evtflow_cli::run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

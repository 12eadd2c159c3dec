fn main() {
    if let Err(e) = agentcert::run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

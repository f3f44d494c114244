fn main() {
    if let Err(err) = cotmpl_cli::run_from_env() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

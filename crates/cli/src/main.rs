fn main() {
    bgproc_cli::init_tracing();

    if let Err(error) = bgproc_cli::run(std::env::args_os()) {
        eprintln!("{error:#}");
        std::process::exit(1);
    }
}

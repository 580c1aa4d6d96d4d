fn main() {
    if let Err(err) = cohort_engine::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

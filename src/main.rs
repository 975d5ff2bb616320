fn main() {
    if let Err(err) = ab_simulator_lib::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

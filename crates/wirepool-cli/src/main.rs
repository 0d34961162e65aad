fn main() {
    wirepool_cli::run_cli();
}

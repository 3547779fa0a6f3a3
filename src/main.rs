fn main() -> Result<(), Box<dyn std::error::Error>> {
    uru::cli::main()
}

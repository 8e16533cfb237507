use anyhow::Result;

fn main() -> Result<()> {
    boltbox::cli::run()
}

use anyhow::Result;

fn main() -> Result<()> {
    stembox::cli::run()
}

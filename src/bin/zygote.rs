use anyhow::Result;

fn main() -> Result<()> {
    sandbox_zygote::cli::run()
}

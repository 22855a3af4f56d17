fn main() -> anyhow::Result<()> {
    cairn::run()?;
    Ok(())
}

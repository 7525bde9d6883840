fn main() -> anyhow::Result<()> {
    let code = reactd::srv::main()?;
    std::process::exit(code);
}

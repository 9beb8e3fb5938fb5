fn main() -> anyhow::Result<()> {
    butler_registry_server::run()
}

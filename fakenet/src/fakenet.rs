fn main() -> anyhow::Result<()> {
    fakenet_core::run()
}

//! `uplink` binary entry point.

fn main() -> anyhow::Result<()> {
    uplink_cli::run()
}

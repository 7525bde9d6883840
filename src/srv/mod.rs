pub mod cli;
pub mod config;
pub mod error;
pub mod event;
pub mod listener;
pub mod lockfile;
pub mod privilege;
pub mod server;
pub mod spawner;
pub mod stopper;
pub mod supervisor;

pub fn main() -> anyhow::Result<i32> {
    cli::run()
}

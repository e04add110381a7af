mod bindings;
mod bootstrap;
mod cli;
mod run;
mod sink;

use anyhow::Result;

fn main() -> Result<()> {
    let args = cli::parse();
    run::run(args)
}

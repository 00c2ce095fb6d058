//! Allzpark
//!
//! 入口：解析参数、初始化日志，然后运行行式控制台。

mod cli;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    if args.dump_environ {
        return cli::dump_environ();
    }
    allzpark::observability::init(args.verbose);
    cli::run(args).await
}

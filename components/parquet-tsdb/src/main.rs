use parquet_tsdb::{
    commands::{Converter, Server},
    db::DbSubsystem,
    runtime::App,
    search::SearchSubsystem,
};
use std::{process::ExitCode, sync::Arc};

#[tokio::main]
async fn main() -> ExitCode {
    let db = Arc::new(DbSubsystem::default());
    let search = Arc::new(SearchSubsystem::default());

    App::new(Converter::new(db.clone()), Server::new(search.clone()))
        .with_subsystem(db)
        .with_subsystem(search)
        .with_global_logger(true)
        .run(std::env::args_os())
        .await
        .exit_code()
}

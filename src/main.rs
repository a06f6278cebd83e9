use std::process::ExitCode;

use clap::Parser;

use twaindirect::{Args, fake_http_client, real_http_client, run_with_log_level};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mut stdout = std::io::stdout();

    let run_result = async {
        let log_level = args.log_level();
        let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
        let http = match maybe_fake_args {
            Some(fake_args) => fake_http_client(fake_args),
            None => real_http_client()?,
        };

        run_with_log_level(command, &mut stdout, http, log_level).await
    }
    .await;

    match run_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}

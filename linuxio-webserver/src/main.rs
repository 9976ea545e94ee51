use anyhow::Context as _;
use linuxio_webserver::config::ConfHandle;
use linuxio_webserver::service::{WebserverService, SERVICE_NAME};

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args();
    let executable = args.next().context("executable name is missing from the environment")?;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config-path" => {
                let path = args.next().context("missing value for --config-path")?;
                // At this point the program is single-threaded.
                std::env::set_var("LINUXIO_CONFIG_PATH", &path);
            }
            "--help" | "-h" => {
                println!(
                    r#"{SERVICE_NAME}

USAGE:
    "{executable}" [--config-path <CONFIG_PATH>]
"#
                );
                return Ok(());
            }
            unknown => anyhow::bail!("unknown argument `{unknown}`"),
        }
    }

    let conf_handle = ConfHandle::init().context("unable to initialize configuration")?;
    let mut service = WebserverService::load(conf_handle).context("service loading failed")?;

    let _state = service.start().context("failed to start")?;

    // Waiting for some stop signal (CTRL-C…)
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("failed to build the async runtime")?;
    rt.block_on(build_signals_fut())?;

    service.stop();

    Ok(())
}

async fn build_signals_fut() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate_signal = signal(SignalKind::terminate()).context("failed to create terminate signal stream")?;
    let mut quit_signal = signal(SignalKind::quit()).context("failed to create quit signal stream")?;
    let mut interrupt_signal = signal(SignalKind::interrupt()).context("failed to create interrupt signal stream")?;

    futures::future::select_all(vec![
        Box::pin(terminate_signal.recv()),
        Box::pin(quit_signal.recv()),
        Box::pin(interrupt_signal.recv()),
    ])
    .await;

    Ok(())
}

use std::error::Error;

use berak_live::stream::proto::FRAGMENT_UPDATE_EVENT;
use berak_live::{
    EventHandlers, FragmentUpdate, HttpSseTransport, StreamClient, StreamSelector,
    SubscriptionOptions,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use url::Url;

const UPDATES_TO_PRINT: usize = 5;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("berak_live=debug")),
        )
        .init();

    let base = Url::parse("http://127.0.0.1:5000/")?;
    let endpoint = StreamSelector::daily(2024, 6).endpoint(&base)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let (update_tx, mut updates) = mpsc::unbounded_channel();
        let handlers = EventHandlers::new()
            .on_message(move |message| match FragmentUpdate::from_message(message) {
                Ok(update) => {
                    let _ = update_tx.send(update);
                }
                Err(err) => eprintln!("undecodable update: {err}"),
            })
            .on_error(|fault| eprintln!("{fault}"))
            .on_exhausted(|attempts| eprintln!("gave up after {attempts} reconnects"));

        let client = StreamClient::spawn(
            endpoint,
            HttpSseTransport::new()?,
            SubscriptionOptions::default().with_event_name(FRAGMENT_UPDATE_EVENT),
            handlers,
        );
        client.connect();

        let mut printed = 0;
        while let Some(update) = updates.recv().await {
            for (element_id, html) in &update.fragments {
                println!("#{element_id} <- {html}");
            }
            printed += 1;
            if printed == UPDATES_TO_PRINT {
                break;
            }
        }

        client.disconnect();
        Ok::<(), Box<dyn Error>>(())
    })?;

    Ok(())
}

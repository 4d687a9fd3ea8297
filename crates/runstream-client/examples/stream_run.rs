use runstream_client::prelude::*;
use runstream_client::init_observability;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), StreamError> {
    init_observability();
    let client = StreamClient::from_env()?;

    let mut stream = client.open(
        StreamOptions::new("demo", "example-session", "demo")
            .scenario(Scenario::default().seed(7)),
    )?;

    while let Some(event) = stream.next_event().await {
        let terminal = event.is_terminal();
        match event {
            RunEvent::Token(text) => print!("{text}"),
            RunEvent::Cost(cost) => eprintln!("[cost {cost:.4}]"),
            RunEvent::Error {
                will_retry,
                message,
            } => eprintln!("stream error (retrying: {will_retry}): {message}"),
            RunEvent::Resumed => eprintln!("[resumed]"),
            RunEvent::Done => println!(),
            RunEvent::Cancelled | RunEvent::Limited | RunEvent::Aborted => {
                eprintln!("run ended early: {event:?}")
            }
            RunEvent::Hello | RunEvent::EventId(_) => {}
        }
        if terminal {
            break;
        }
    }
    Ok(())
}

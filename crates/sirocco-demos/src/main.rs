//! hello-loop: two tickers and a Ctrl-C handler on one dispatcher.
//!
//! Run with `RUST_LOG=debug` to watch the loop's lifecycle decisions.

use std::time::Duration;

use log::info;
use sirocco_core::{Context, Coroutine, Dispatcher, Event, LoopError, Step, WaitRequest};

/// Prints a greeting every `period`; stops by itself after `limit`
/// firings when a limit is given.
fn ticker(name: &'static str, period: Duration, limit: Option<u32>) -> impl Coroutine {
    let mut fired = 0u32;
    move |event: Event, _ctx: &mut Context| match event {
        Event::Start => Step::Suspend(WaitRequest::sleep(period)),
        Event::Elapsed => {
            fired += 1;
            println!("Hello, {}! ({})", name, fired);
            match limit {
                Some(limit) if fired >= limit => Step::Complete(Box::new(fired)),
                _ => Step::Suspend(WaitRequest::sleep(period)),
            }
        }
        // A stop tears nothing down, but cancellation may arrive if the
        // process is winding down.
        _ => Step::Complete(Box::new(fired)),
    }
}

fn main() -> Result<(), LoopError> {
    env_logger::init();

    let mut dispatcher = Dispatcher::new()?;
    dispatcher.spawn(ticker("fast", Duration::from_secs(1), None));
    let limited = dispatcher.spawn(ticker("slow", Duration::from_millis(2500), Some(3)));

    dispatcher.spawn(|event: Event, ctx: &mut Context| match event {
        Event::Start => Step::Suspend(WaitRequest::signal(libc::SIGINT)),
        Event::Signal(_) => {
            println!();
            info!("got SIGINT, shutting the loop down");
            ctx.stop();
            Step::Complete(Box::new(()))
        }
        _ => Step::Complete(Box::new(())),
    });

    dispatcher.run_forever()?;

    if dispatcher.is_done(&limited) {
        info!("slow ticker finished before shutdown");
    }
    Ok(())
}

use std::sync::Arc;
use std::thread;

use serde_json::json;

use signal_composer::{Composer, ComposerConfig, ConfigDocument, PluginRegistry};

const THREADS: u32 = 4;
const EVENTS: u32 = 200;

fn composer() -> Arc<Composer> {
    let signals: Vec<serde_json::Value> = (0..THREADS)
        .flat_map(|i| {
            [
                json!({"uid": format!("raw{i}"), "event": format!("low-can/raw{i}")}),
                json!({"uid": format!("copy{i}"), "depends": format!("raw{i}"),
                       "onReceived": {"function": "plugin://builtin/setSignalValue", "args": {"name": format!("copy{i}")}}}),
            ]
        })
        .collect();
    let composer = Composer::new(ComposerConfig::named("composer"), Arc::new(PluginRegistry::with_builtin()));
    let document: ConfigDocument = serde_json::from_value(json!({
        "sources": [{"uid": "can", "api": "low-can", "retention": 3600}],
        "signals": signals
    }))
    .unwrap();
    composer.load_config(&document).unwrap();
    composer
}

#[test]
fn concurrent_dispatch_and_subscription() {
    let composer = composer();

    let writers: Vec<_> = (0..THREADS)
        .map(|i| {
            let composer = Arc::clone(&composer);
            thread::spawn(move || {
                for n in 1..=EVENTS {
                    let payload = json!({"value": n, "timestamp": u64::from(n) * 1_000_000});
                    composer.dispatch_event(&format!("low-can/raw{i}"), &payload).unwrap();
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let composer = Arc::clone(&composer);
            thread::spawn(move || {
                let mut received = 0_usize;
                for _ in 0..50 {
                    let (session, stream) = composer.open_session().unwrap();
                    composer.subscribe(session, &["copy"]).unwrap();
                    while let Ok(Some(_)) = stream.try_recv() {
                        received += 1;
                    }
                    composer.close_session(session).unwrap();
                }
                received
            })
        })
        .collect();

    for writer in writers {
        writer.join().unwrap();
    }
    for reader in readers {
        reader.join().unwrap();
    }

    for i in 0..THREADS {
        let raw = composer.find_signal(&format!("raw{i}")).unwrap();
        let copy = composer.find_signal(&format!("copy{i}")).unwrap();
        assert_eq!(raw.history().len(), EVENTS as usize);
        assert_eq!(raw.last(), copy.last());
        assert_eq!(raw.average(0), Some(f64::from(EVENTS + 1) / 2.0));
    }
    assert_eq!(composer.session_count(), 0);
}

#[test]
fn concurrent_writers_on_one_signal_keep_every_sample() {
    let composer = Composer::new(ComposerConfig::named("composer"), Arc::new(PluginRegistry::with_builtin()));
    let document: ConfigDocument = serde_json::from_value(json!({
        "sources": [{"uid": "can", "api": "low-can", "retention": 3600}],
        "signals": [{"uid": "shared", "event": "low-can/shared"}]
    }))
    .unwrap();
    composer.load_config(&document).unwrap();

    let writers: Vec<_> = (0..THREADS)
        .map(|i| {
            let composer = Arc::clone(&composer);
            thread::spawn(move || {
                for n in 1..=EVENTS {
                    let sample = i * EVENTS + n;
                    let payload = json!({"value": sample, "timestamp": u64::from(sample) * 1_000});
                    composer.dispatch_event("low-can/shared", &payload).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let total = THREADS * EVENTS;
    let shared = composer.find_signal("shared").unwrap();
    assert_eq!(shared.history().len(), total as usize);
    assert_eq!(shared.history().oldest(), Some(1_000));
    assert_eq!(shared.history().newest(), Some(u64::from(total) * 1_000));
    assert_eq!(shared.average(0), Some(f64::from(total + 1) / 2.0));

    let last = shared.last().and_then(|v| v.as_number()).unwrap();
    assert!(last >= 1.0 && last <= f64::from(total) && last.fract() == 0.0);
}

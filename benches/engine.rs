use criterion::{criterion_group, criterion_main, Criterion};

use threadline::config::Config;
use threadline::model::raw::{AttachmentSource, RawAttachment, RawMessage};
use threadline::{CancelToken, Engine};

/// `threads` conversations of `depth` replies each, every fifth message
/// carrying the same drawing.
fn synthetic_batch(threads: usize, depth: usize) -> Vec<RawMessage> {
    let drawing = vec![0x25u8; 32 * 1024];
    let mut out = Vec::with_capacity(threads * depth);
    for t in 0..threads {
        for d in 0..depth {
            let mut r = RawMessage::new(
                Some(&format!("<t{t}-m{d}@example.com>")),
                &format!("{}Package {t} coordination", if d > 0 { "Re: " } else { "" }),
                &format!(
                    "Update {d} on package {t}: the steel delivery is confirmed for bay {}.\n\n\
                     CAUTION: External email. Do not click links unless you know the sender.\n\
                     > earlier text quoted from message {}",
                    d % 7,
                    d.saturating_sub(1)
                ),
            );
            if d > 0 {
                r.in_reply_to = Some(format!("<t{t}-m{}@example.com>", d - 1));
            }
            r.sender = Some(format!("user{}@example.com", d % 3));
            r.recipients.to = vec!["team@example.com".into()];
            r.date_sent = Some(format!(
                "Mon, {:02} Jan 2024 {:02}:00:00 +0000",
                1 + t % 28,
                d % 24
            ));
            if d % 5 == 0 {
                r.attachments.push(RawAttachment {
                    filename: Some("drawing.pdf".into()),
                    path: None,
                    content_type: None,
                    content: AttachmentSource::Bytes(drawing.clone()),
                });
            }
            out.push(r);
        }
    }
    out
}

fn bench_engine_run(c: &mut Criterion) {
    let engine = Engine::new(Config::default()).unwrap();
    let batch = synthetic_batch(200, 10);

    c.bench_function("run_2000_messages", |b| {
        b.iter(|| engine.run(batch.clone(), &CancelToken::new()).unwrap())
    });
}

fn bench_canonicalize(c: &mut Criterion) {
    let canonicalizer = threadline::canonical::Canonicalizer::new(&Config::default()).unwrap();
    let batch = synthetic_batch(10, 10);

    c.bench_function("canonicalize_100_messages", |b| {
        b.iter(|| {
            batch
                .iter()
                .map(|r| canonicalizer.canonicalize_message(r, uuid::Uuid::nil()))
                .count()
        })
    });
}

criterion_group!(benches, bench_engine_run, bench_canonicalize);
criterion_main!(benches);

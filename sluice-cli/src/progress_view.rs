//! Progress bar rendering: maps the engine's `(current, total, description)`
//! callback onto indicatif bars, one per in-flight stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use sluice::ProgressCallback;

pub struct ProgressView {
    multi: MultiProgress,
    bars: Arc<Mutex<HashMap<String, ProgressBar>>>,
}

impl ProgressView {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn callback(&self) -> ProgressCallback {
        let multi = self.multi.clone();
        let bars = self.bars.clone();
        Arc::new(move |current, total, description| {
            let mut bars = bars.lock().unwrap();
            let bar = bars.entry(description.to_owned()).or_insert_with(|| {
                let bar = multi.add(ProgressBar::new(total));
                bar.set_style(bar_style(total));
                bar.set_message(description.to_owned());
                bar
            });
            if bar.length() != Some(total) {
                bar.set_length(total);
                bar.set_style(bar_style(total));
            }
            bar.set_position(current);
        })
    }

    pub fn finish(&self) {
        let bars = self.bars.lock().unwrap();
        for bar in bars.values() {
            if !bar.is_finished() {
                bar.finish();
            }
        }
    }
}

fn bar_style(total: u64) -> ProgressStyle {
    // Unknown totals render as a byte spinner instead of a bar.
    let template = if total > 0 {
        "{msg} [{bar:25}] {bytes}/{total_bytes} {bytes_per_sec} {eta}"
    } else {
        "{msg} {spinner} {bytes} {bytes_per_sec}"
    };
    ProgressStyle::with_template(template)
        .expect("valid progress template")
        .progress_chars("=> ")
}

use std::rc::Rc;

use futures::executor::block_on;
use virtual_collection::{
    ArrayDataProvider, ContentOptions, FlatContentHandler, ItemContext, Key, ScrollMetrics,
};
use virtual_collection_adapter::{CollectionStore, Controller, RowRenderer};

const ROW_HEIGHT: u64 = 24;
const VIEWPORT: u32 = 240;

struct Lines;

impl RowRenderer<String> for Lines {
    type Node = String;

    fn item(&self, cx: ItemContext<'_, String>) -> String {
        format!("{:>4} {}", cx.index, cx.data)
    }

    fn skeleton(&self) -> String {
        "   - loading".to_string()
    }

    fn skeleton_height(&self) -> u32 {
        ROW_HEIGHT as u32
    }
}

fn main() {
    // Example: an adapter loop without any UI toolkit.
    //
    // Each frame renders, runs pending fetches, reports the measured height of the rendered
    // rows, then scrolls a bit further down, until the data source is exhausted.
    let provider = ArrayDataProvider::new(
        (0..120usize).map(|i| (Key::from(i), format!("message #{i}"))),
    );
    let store = Rc::new(CollectionStore::new(Lines));
    let handler = FlatContentHandler::new(
        Rc::new(provider),
        Rc::clone(&store),
        ContentOptions::default().with_fetch_size(20),
    );
    let c = Controller::new(Rc::new(handler));

    let first = c.render();
    println!("first frame: {} skeleton rows", first.len());

    let mut scroll_top = 0u64;
    loop {
        if let Err(err) = block_on(c.pump()) {
            println!("initial fetch failed: {err}");
            return;
        }
        let rows = c.render();
        let height = rows.len() as u64 * ROW_HEIGHT;
        let metrics = ScrollMetrics::new(scroll_top, height, VIEWPORT);
        if !block_on(c.on_rendered(0, height, metrics)) {
            continue;
        }

        let snapshot = c.snapshot();
        println!(
            "scroll_top={scroll_top} rows={} done={} last={:?}",
            snapshot.row_count,
            snapshot.current.done,
            rows.last()
        );
        if snapshot.current.done {
            break;
        }

        scroll_top = (scroll_top + 4 * ROW_HEIGHT).min(metrics.max_scroll_top());
        block_on(c.on_scroll(ScrollMetrics::new(scroll_top, height, VIEWPORT)));
    }

    println!("done: {} rows, revision {}", store.row_count(), store.revision());
}

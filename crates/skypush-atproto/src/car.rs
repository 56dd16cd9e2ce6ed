//! CAR block parsing for firehose commits.
//!
//! Each `#commit` frame carries a CAR v1 slice holding the commit block, the
//! changed MST nodes, and the new record blocks. Records are looked up by the
//! CID string listed on each operation.

use std::collections::HashMap;
use std::io::Cursor;

use iroh_car::CarReader;
use tracing::trace;

use crate::AtprotoError;

/// Blocks of a CAR slice keyed by CID string.
pub type BlockMap = HashMap<String, Vec<u8>>;

/// Read every block of a CAR slice into a CID -> data map.
pub async fn read_blocks(car_bytes: &[u8]) -> Result<BlockMap, AtprotoError> {
    let cursor = Cursor::new(car_bytes);
    let mut reader = CarReader::new(cursor)
        .await
        .map_err(|e| AtprotoError::CarParse(format!("failed to read commit CAR: {}", e)))?;

    let mut blocks = HashMap::new();

    loop {
        match reader.next_block().await {
            Ok(Some((cid, data))) => {
                blocks.insert(cid.to_string(), data);
            }
            Ok(None) => break,
            Err(e) => {
                return Err(AtprotoError::CarParse(format!(
                    "failed to read block: {}",
                    e
                )));
            }
        }
    }

    trace!(block_count = blocks.len(), "parsed commit blocks");
    Ok(blocks)
}

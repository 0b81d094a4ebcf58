use std::collections::HashSet;
use std::pin::pin;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tracing::{debug, info, instrument};

use crate::error::DownloadError;
use crate::remote::{BlockDescriptor, BlockSource, SnapshotId};

/// The complete, duplicate-free block listing of one snapshot.
///
/// Shared read-only between fetch workers.
#[derive(Debug, Clone)]
pub struct Inventory {
    blocks: Arc<[BlockDescriptor]>,
}

impl Inventory {
    pub fn blocks(&self) -> &[BlockDescriptor] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Builds an inventory, rejecting a repeated block index.
    pub fn try_from_blocks(
        blocks: impl IntoIterator<Item = BlockDescriptor>,
    ) -> Result<Self, DownloadError> {
        let mut seen = HashSet::new();
        let blocks = blocks
            .into_iter()
            .map(|block| {
                if seen.insert(block.index) {
                    Ok(block)
                } else {
                    Err(DownloadError::DuplicateBlock(block.index))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            blocks: blocks.into(),
        })
    }
}

/// Lazily pages through the block listing of `snapshot`.
///
/// The stream ends once a page comes back without a continuation token (an
/// empty token counts as none), and
/// yields an error (then ends) on the first failed request. It cannot be
/// restarted; listing again means a fresh pass over all pages.
pub fn list_blocks<'a, S: BlockSource + ?Sized>(
    source: &'a S,
    snapshot: &'a SnapshotId,
    page_size: u32,
) -> impl Stream<Item = Result<BlockDescriptor, DownloadError>> + 'a {
    async_stream::try_stream! {
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = source
                .list_blocks(snapshot, page_size, page_token.as_deref())
                .await
                .map_err(|err| DownloadError::Listing(Box::new(err)))?;
            pages += 1;
            debug!(page = pages, blocks = page.blocks.len(), "listed page");

            for block in page.blocks {
                yield block;
            }

            match page.next_token.filter(|next| !next.is_empty()) {
                Some(next) if page_token.as_deref() == Some(next.as_str()) => {
                    Err::<(), _>(DownloadError::Listing(
                        format!("continuation token {next:?} repeated").into(),
                    ))?;
                }
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
    }
}

/// Drains the full listing into an [`Inventory`].
///
/// Any listing error is fatal, since a partial inventory cannot be told apart
/// from a complete one.
#[instrument(skip_all, fields(%snapshot))]
pub async fn collect_inventory<S: BlockSource + ?Sized>(
    source: &S,
    snapshot: &SnapshotId,
    page_size: u32,
) -> Result<Inventory, DownloadError> {
    let mut stream = pin!(list_blocks(source, snapshot, page_size));
    let mut blocks = vec![];
    while let Some(block) = stream.next().await {
        blocks.push(block?);
    }

    let inventory = Inventory::try_from_blocks(blocks)?;
    info!(blocks = inventory.len(), "listed all snapshot blocks");
    Ok(inventory)
}

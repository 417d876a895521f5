//! Block validation shared by live consensus and sync

use crate::error::ValidationError;
use crate::leader;
use pos_chain::processor;
use pos_chain::{Block, LedgerStore};

/// Check that `block` may extend the local chain.
///
/// The block must sit at tip + 1 on top of the tip, come from the proposer
/// selected for its round, carry valid signatures, and every transaction
/// must pass the nonce and balance rules against current state.
///
/// A block at any other height has no local parent to select a proposer
/// from, so height is checked before the proposer in that case.
pub fn validate_block(block: &Block, store: &dyn LedgerStore) -> Result<(), ValidationError> {
    let tip = store.tip()?;
    if block.height > tip.height + 1 {
        return Err(ValidationError::NeedSync {
            height: block.height,
            tip: tip.height,
        });
    }
    if block.height <= tip.height {
        return Err(ValidationError::Stale {
            height: block.height,
            tip: tip.height,
        });
    }

    let validators = store.validators()?;
    let expected = leader::round_state(&tip, block.round, &validators)?.proposer;
    if block.proposer != expected {
        return Err(ValidationError::WrongProposer {
            height: block.height,
            expected,
            got: block.proposer,
        });
    }

    if block.prev_hash != tip.hash {
        return Err(ValidationError::ParentMismatch {
            height: block.height,
        });
    }

    block.verify_signature()?;
    processor::check_block_transactions(block, store)?;
    Ok(())
}

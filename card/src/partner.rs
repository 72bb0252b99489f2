use crate::errors::{CardError, CardResult};

pub const PARTNER_CAPACITY: usize = 16;

/// Slot value marking an unused entry.
pub const EMPTY_SLOT: u8 = 0;

/// Fixed-capacity allow-list of partner identifiers.
///
/// Insertion takes the first empty slot, removal zeroes the matching slot.
/// Duplicates are not suppressed, so an identifier added twice occupies two
/// slots and needs two removals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartnerRegistry {
    slots: [u8; PARTNER_CAPACITY],
}

impl PartnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, partner_id: u8) -> CardResult<()> {
        if partner_id == EMPTY_SLOT {
            return Err(CardError::InvalidPartner(partner_id));
        }

        let slot = self
            .slots
            .iter_mut()
            .find(|slot| **slot == EMPTY_SLOT)
            .ok_or(CardError::RegistryFull)?;
        *slot = partner_id;
        log::debug!("Partner {:#04x} registered", partner_id);
        Ok(())
    }

    /// Clear the first slot holding `partner_id`.
    pub fn remove(&mut self, partner_id: u8) -> CardResult<()> {
        if partner_id == EMPTY_SLOT {
            return Err(CardError::InvalidPartner(partner_id));
        }

        let slot = self
            .slots
            .iter_mut()
            .find(|slot| **slot == partner_id)
            .ok_or(CardError::InvalidPartner(partner_id))?;
        *slot = EMPTY_SLOT;
        log::debug!("Partner {:#04x} removed", partner_id);
        Ok(())
    }

    pub fn contains(&self, partner_id: u8) -> bool {
        partner_id != EMPTY_SLOT && self.slots.contains(&partner_id)
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| **slot != EMPTY_SLOT).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.slots = [EMPTY_SLOT; PARTNER_CAPACITY];
    }
}

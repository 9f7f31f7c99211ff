/// Per-scope history cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPage {
    /// Number of messages already loaded, oldest-first insertion.
    pub offset: usize,
    pub has_more: bool,
    pub loading: bool,
}

impl Default for SessionPage {
    fn default() -> Self {
        Self {
            offset: 0,
            has_more: true,
            loading: false,
        }
    }
}

/// Cursor plus the reset epoch a load was started under.
#[derive(Debug, Default)]
pub(crate) struct PageSlot {
    pub(crate) page: SessionPage,
    epoch: u64,
}

impl PageSlot {
    pub(crate) fn reset(&mut self) {
        self.epoch += 1;
        self.page = SessionPage::default();
    }

    /// Marks the page as loading and returns the epoch the load belongs to.
    pub(crate) fn try_begin(&mut self) -> Result<u64, &'static str> {
        if self.page.loading {
            return Err("page load already in flight");
        }
        if !self.page.has_more {
            return Err("history exhausted");
        }
        self.page.loading = true;
        Ok(self.epoch)
    }

    /// Clears the loading flag; false when the cursor was reset since `epoch`.
    pub(crate) fn finish(&mut self, epoch: u64) -> bool {
        if self.epoch != epoch {
            return false;
        }
        self.page.loading = false;
        true
    }

    pub(crate) fn advance(&mut self, count: usize) {
        self.page.offset += count;
        if count == 0 {
            self.page.has_more = false;
        }
    }
}

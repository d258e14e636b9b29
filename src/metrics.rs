#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageMetrics {
    pub page_number: usize,
    pub record_ms: f64,
    pub instruction_count: usize,
    pub flush_count: usize,
    pub data_bytes: u64,
    pub block_bytes: u64,
    pub soft_recoveries: usize,
    pub hard_recoveries: usize,
    pub low_memory_warnings: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentMetrics {
    pub pages: Vec<PageMetrics>,
    pub total_record_ms: f64,
    pub total_bytes: u64,
    pub total_recoveries: usize,
}

impl DocumentMetrics {
    pub fn push(&mut self, page: PageMetrics) {
        self.total_record_ms += page.record_ms;
        self.total_bytes += page.data_bytes + page.block_bytes;
        self.total_recoveries += page.soft_recoveries + page.hard_recoveries;
        self.pages.push(page);
    }
}

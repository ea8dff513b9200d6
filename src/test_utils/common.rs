use crate::KvEntry;
use crate::ListResponse;

pub(crate) fn list_response(
    index: u64,
    pairs: &[(&str, &str)],
) -> ListResponse {
    ListResponse {
        entries: pairs.iter().map(|(k, v)| KvEntry::leaf(*k, *v)).collect(),
        index,
    }
}

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
    println!("setup logger for unit test.");
}

pub mod allocator;
pub mod bookkeeping;

#![allow(unused_macros)]

/// Helper macro for reading locked items
///
/// ```rust, ignore
///  let flags = read_lock!(writer.flags);
///  println!("{:?}", *flags);
/// ```
macro_rules! read_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.read().map_err(|_| crate::Error::LockError)?
    };
}

/// Helper macro for writing to locked items
///
/// ```rust, ignore
///  let mut flags = write_lock!(writer.flags);
///  flags.remove(ComImageFlags::IL_ONLY);
/// ```
macro_rules! write_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.write().map_err(|_| crate::Error::LockError)?
    };
}

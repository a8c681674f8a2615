mod rewind;

pub(crate) use self::rewind::Rewind;

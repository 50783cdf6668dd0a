pub mod chat;
pub mod messaging;

#[cfg(test)]
pub mod test_util;

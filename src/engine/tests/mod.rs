pub mod helpers;
mod tests_precedence;

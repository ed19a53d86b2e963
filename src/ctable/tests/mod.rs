mod tests_column;
mod tests_rowblob;
mod tests_simple;

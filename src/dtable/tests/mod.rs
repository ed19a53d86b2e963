mod helpers;

mod tests_memory;
mod tests_overlay;
mod tests_rwatx;
mod tests_simple;
mod tests_transform;

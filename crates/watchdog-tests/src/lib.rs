//! Integration tests for the WatchDog hub core live under `tests/`.

//! Benchmarks for pthreads-emu live under `benches/`.

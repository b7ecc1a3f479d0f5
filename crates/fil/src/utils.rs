//! Parallelism switch shared by the device emulation and the kernels.

use rayon::prelude::*;

/// Whether parallel execution is allowed.
///
/// When `Parallel`, thread blocks of a kernel launch are spread over the rayon
/// pool. When `Sequential`, blocks run one after another on the calling thread.
/// Block results never depend on this choice: every block owns a disjoint slice
/// of the output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Parallelism {
    Sequential,
    #[default]
    Parallel,
}

impl Parallelism {
    /// Create from thread count semantics.
    ///
    /// - 0 = auto (parallel if rayon pool has multiple threads, sequential otherwise)
    /// - 1 = sequential
    /// - >1 = parallel
    #[inline]
    pub fn from_threads(n_threads: usize) -> Self {
        if n_threads == 1 || (n_threads == 0 && rayon::current_num_threads() == 1) {
            Parallelism::Sequential
        } else {
            Parallelism::Parallel
        }
    }

    /// Returns `true` if parallel execution is allowed.
    #[inline]
    pub fn is_parallel(self) -> bool {
        matches!(self, Parallelism::Parallel)
    }

    /// Parallel for_each with per-thread initialization.
    ///
    /// The `init` closure is called once per worker thread (in parallel mode)
    /// or once total (in sequential mode). The resulting value is passed to `f`
    /// and reused across iterations on the same thread.
    #[inline]
    pub fn maybe_par_for_each_init<T, I, INIT, S, F>(self, iter: I, init: INIT, f: F)
    where
        T: Send,
        I: IntoIterator<Item = T> + IntoParallelIterator<Item = T>,
        INIT: Fn() -> S + Sync + Send,
        F: Fn(&mut S, T) + Sync + Send,
    {
        if self.is_parallel() {
            iter.into_par_iter().for_each_init(init, f);
        } else {
            let mut state = init();
            iter.into_iter().for_each(|item| f(&mut state, item));
        }
    }
}

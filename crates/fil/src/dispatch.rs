//! Kernel variant table.
//!
//! Every combination of storage kind, column caching, leaf algorithm and rows
//! per thread has its own monomorphized kernel. The table of entry points is
//! built once, checked for totality, and indexed by [`VariantKey`]:
//!
//! ```text
//! index = ((storage * 2 + cols_in_shmem) * 4 + algo) * 4 + (n_items - 1)
//! ```
//!
//! The plan builder is the only producer of keys, so a key without an entry is
//! a bug and panics.

use std::sync::OnceLock;

use crate::kernel::{
    Categorical, GroveFewClasses, GroveManyClasses, KernelFn, LaunchArgs, LeafAlgorithm, UnaryBinary, launch,
};
use crate::plan::{LeafAlgo, MAX_N_ITEMS};
use crate::repr::{DenseNode, DenseStorage, SparseNode8, SparseNode16, SparseStorage, StorageKind, StorageSelect};

/// Number of kernel variants.
pub const N_VARIANTS: usize = StorageKind::ALL.len() * 2 * LeafAlgo::ALL.len() * MAX_N_ITEMS;

/// Selects one kernel variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariantKey {
    pub storage: StorageKind,
    pub cols_in_shmem: bool,
    pub algo: LeafAlgo,
    pub n_items: usize,
}

impl VariantKey {
    /// Position in the kernel table.
    ///
    /// # Panics
    ///
    /// Panics if `n_items` is outside `1..=4`.
    #[inline]
    pub fn index(&self) -> usize {
        assert!(
            (1..=MAX_N_ITEMS).contains(&self.n_items),
            "n_items {} outside 1..={MAX_N_ITEMS}",
            self.n_items
        );
        ((self.storage.index() * 2 + usize::from(self.cols_in_shmem)) * LeafAlgo::ALL.len() + self.algo.index())
            * MAX_N_ITEMS
            + (self.n_items - 1)
    }

    /// Every key, in table order.
    pub fn all() -> impl Iterator<Item = VariantKey> {
        StorageKind::ALL.into_iter().flat_map(|storage| {
            [false, true].into_iter().flat_map(move |cols_in_shmem| {
                LeafAlgo::ALL.into_iter().flat_map(move |algo| {
                    (1..=MAX_N_ITEMS).map(move |n_items| VariantKey {
                        storage,
                        cols_in_shmem,
                        algo,
                        n_items,
                    })
                })
            })
        })
    }
}

struct KernelTable {
    entries: Vec<Option<(VariantKey, KernelFn)>>,
}

impl KernelTable {
    fn new() -> Self {
        Self {
            entries: vec![None; N_VARIANTS],
        }
    }

    fn insert(&mut self, key: VariantKey, kernel: KernelFn) {
        let slot = &mut self.entries[key.index()];
        assert!(slot.is_none(), "kernel variant {key:?} registered twice");
        *slot = Some((key, kernel));
    }

    /// Panics unless every key has exactly its own entry.
    fn validate(&self) {
        for key in VariantKey::all() {
            match self.entries[key.index()] {
                Some((registered, _)) => assert_eq!(registered, key, "kernel table slot mismatch"),
                None => panic!("kernel variant {key:?} is not registered"),
            }
        }
    }

    fn get(&self, key: VariantKey) -> KernelFn {
        match self.entries[key.index()] {
            Some((_, kernel)) => kernel,
            None => panic!("kernel variant {key:?} is not registered"),
        }
    }
}

fn key_of<S: StorageSelect, A: LeafAlgorithm>(cols_in_shmem: bool, n_items: usize) -> VariantKey {
    VariantKey {
        storage: S::KIND,
        cols_in_shmem,
        algo: A::ALGO,
        n_items,
    }
}

macro_rules! register {
    (@n $table:ident, $storage:ty, $cols:literal, $algo:ty, [$($n:literal),*]) => {
        $(
            $table.insert(key_of::<$storage, $algo>($cols, $n), launch::<$storage, $cols, $algo, $n> as KernelFn);
        )*
    };
    (@algo $table:ident, $storage:ty, $cols:literal) => {
        register!(@n $table, $storage, $cols, UnaryBinary, [1, 2, 3, 4]);
        register!(@n $table, $storage, $cols, GroveFewClasses, [1, 2, 3, 4]);
        register!(@n $table, $storage, $cols, GroveManyClasses, [1, 2, 3, 4]);
        register!(@n $table, $storage, $cols, Categorical, [1, 2, 3, 4]);
    };
    ($table:ident, $storage:ty) => {
        register!(@algo $table, $storage, false);
        register!(@algo $table, $storage, true);
    };
}

fn kernel_table() -> &'static KernelTable {
    static TABLE: OnceLock<KernelTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = KernelTable::new();
        register!(table, DenseStorage<DenseNode>);
        register!(table, SparseStorage<SparseNode16>);
        register!(table, SparseStorage<SparseNode8>);
        table.validate();
        tracing::debug!(variants = N_VARIANTS, "kernel table built");
        table
    })
}

/// Entry point for a variant.
pub(crate) fn kernel_for(key: VariantKey) -> KernelFn {
    kernel_table().get(key)
}

/// Look up the plan's variant and run it.
pub(crate) fn dispatch(args: LaunchArgs<'_>) {
    let key = args.plan.shape.variant();
    assert_eq!(
        key.storage,
        args.forest.storage_kind(),
        "plan was built for a different storage"
    );
    let kernel = kernel_for(key);
    args.device.record_launch();
    tracing::debug!(variant = ?key, grid = args.plan.grid, rows = args.plan.rows, "launch");
    kernel(args);
}

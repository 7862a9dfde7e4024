//! A small intrusive red-black tree keyed by `usize` address, ordered so
//! that `first()` always returns the lowest-address node in O(log n).
//!
//! Nodes are never owned or allocated by the tree: callers embed an
//! [`RbState`] field inside the struct they want ordered (a slab frame, a
//! superblock frame) and implement [`RbLink`] to expose it, mirroring the
//! raw-pointer-linked layout an intrusive structure needs when it must live
//! inside the same allocation as the memory it describes.

use core::ptr;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

/// Embedded link fields for a node participating in one [`RbTree`].
pub struct RbState<N> {
    color: Color,
    parent: *mut N,
    left: *mut N,
    right: *mut N,
}

impl<N> RbState<N> {
    pub const fn new() -> Self {
        RbState {
            color: Color::Red,
            parent: ptr::null_mut(),
            left: ptr::null_mut(),
            right: ptr::null_mut(),
        }
    }
}

impl<N> Default for RbState<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Implemented by node types that can be linked into an [`RbTree`].
///
/// # Safety
/// `rb_state` must always return a reference to the *same* embedded
/// `RbState` field for the lifetime of a node's tree membership.
pub unsafe trait RbLink: Sized {
    fn rb_state(node: *mut Self) -> *mut RbState<Self>;
    fn rb_key(node: *const Self) -> usize;
}

pub struct RbTree<N: RbLink> {
    root: *mut N,
}

impl<N: RbLink> RbTree<N> {
    pub const fn new() -> Self {
        RbTree { root: ptr::null_mut() }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_null()
    }

    /// Leftmost (lowest-key) node, or null if the tree is empty.
    pub fn first(&self) -> *mut N {
        let mut current = self.root;
        if current.is_null() {
            return current;
        }
        unsafe {
            while !(*Self::state(current)).left.is_null() {
                current = (*Self::state(current)).left;
            }
        }
        current
    }

    #[inline]
    fn state(node: *mut N) -> *mut RbState<N> {
        N::rb_state(node)
    }

    #[inline]
    fn key(node: *mut N) -> usize {
        N::rb_key(node)
    }

    /// Insert a node that is not already a member of any tree. The node's
    /// embedded `RbState` must be freshly default-initialized.
    ///
    /// # Safety
    /// `node` must be a valid, uniquely-owned pointer that outlives its
    /// tree membership.
    pub unsafe fn insert(&mut self, node: *mut N) {
        unsafe {
            let mut parent: *mut N = ptr::null_mut();
            let mut current = self.root;
            let k = Self::key(node);

            while !current.is_null() {
                parent = current;
                current = if k < Self::key(current) {
                    (*Self::state(current)).left
                } else {
                    (*Self::state(current)).right
                };
            }

            (*Self::state(node)).parent = parent;
            (*Self::state(node)).left = ptr::null_mut();
            (*Self::state(node)).right = ptr::null_mut();
            (*Self::state(node)).color = Color::Red;

            if parent.is_null() {
                self.root = node;
            } else if k < Self::key(parent) {
                (*Self::state(parent)).left = node;
            } else {
                (*Self::state(parent)).right = node;
            }

            self.insert_fixup(node);
        }
    }

    unsafe fn insert_fixup(&mut self, mut node: *mut N) {
        unsafe {
            while !(*Self::state(node)).parent.is_null()
                && (*Self::state((*Self::state(node)).parent)).color == Color::Red
            {
                let parent = (*Self::state(node)).parent;
                let grandparent = (*Self::state(parent)).parent;
                if grandparent.is_null() {
                    break;
                }

                if parent == (*Self::state(grandparent)).left {
                    let uncle = (*Self::state(grandparent)).right;
                    if !uncle.is_null() && (*Self::state(uncle)).color == Color::Red {
                        (*Self::state(parent)).color = Color::Black;
                        (*Self::state(uncle)).color = Color::Black;
                        (*Self::state(grandparent)).color = Color::Red;
                        node = grandparent;
                    } else {
                        if node == (*Self::state(parent)).right {
                            node = parent;
                            self.rotate_left(node);
                        }
                        let parent = (*Self::state(node)).parent;
                        let grandparent = (*Self::state(parent)).parent;
                        (*Self::state(parent)).color = Color::Black;
                        (*Self::state(grandparent)).color = Color::Red;
                        self.rotate_right(grandparent);
                    }
                } else {
                    let uncle = (*Self::state(grandparent)).left;
                    if !uncle.is_null() && (*Self::state(uncle)).color == Color::Red {
                        (*Self::state(parent)).color = Color::Black;
                        (*Self::state(uncle)).color = Color::Black;
                        (*Self::state(grandparent)).color = Color::Red;
                        node = grandparent;
                    } else {
                        if node == (*Self::state(parent)).left {
                            node = parent;
                            self.rotate_right(node);
                        }
                        let parent = (*Self::state(node)).parent;
                        let grandparent = (*Self::state(parent)).parent;
                        (*Self::state(parent)).color = Color::Black;
                        (*Self::state(grandparent)).color = Color::Red;
                        self.rotate_left(grandparent);
                    }
                }
            }
            (*Self::state(self.root)).color = Color::Black;
        }
    }

    unsafe fn rotate_left(&mut self, x: *mut N) {
        unsafe {
            let y = (*Self::state(x)).right;
            if y.is_null() {
                return;
            }
            (*Self::state(x)).right = (*Self::state(y)).left;
            if !(*Self::state(y)).left.is_null() {
                (*Self::state((*Self::state(y)).left)).parent = x;
            }
            (*Self::state(y)).parent = (*Self::state(x)).parent;
            if (*Self::state(x)).parent.is_null() {
                self.root = y;
            } else if x == (*Self::state((*Self::state(x)).parent)).left {
                (*Self::state((*Self::state(x)).parent)).left = y;
            } else {
                (*Self::state((*Self::state(x)).parent)).right = y;
            }
            (*Self::state(y)).left = x;
            (*Self::state(x)).parent = y;
        }
    }

    unsafe fn rotate_right(&mut self, y: *mut N) {
        unsafe {
            let x = (*Self::state(y)).left;
            if x.is_null() {
                return;
            }
            (*Self::state(y)).left = (*Self::state(x)).right;
            if !(*Self::state(x)).right.is_null() {
                (*Self::state((*Self::state(x)).right)).parent = y;
            }
            (*Self::state(x)).parent = (*Self::state(y)).parent;
            if (*Self::state(y)).parent.is_null() {
                self.root = x;
            } else if y == (*Self::state((*Self::state(y)).parent)).left {
                (*Self::state((*Self::state(y)).parent)).left = x;
            } else {
                (*Self::state((*Self::state(y)).parent)).right = x;
            }
            (*Self::state(x)).right = y;
            (*Self::state(y)).parent = x;
        }
    }

    /// Remove `node`, which must currently be a member of this tree.
    ///
    /// # Safety
    /// `node` must be a valid pointer currently linked into `self`.
    pub unsafe fn remove(&mut self, node: *mut N) {
        unsafe {
            let mut y = node;
            let mut y_original_color = (*Self::state(y)).color;
            let x: *mut N;
            let x_parent: *mut N;

            if (*Self::state(node)).left.is_null() {
                x = (*Self::state(node)).right;
                x_parent = (*Self::state(node)).parent;
                self.transplant(node, (*Self::state(node)).right);
            } else if (*Self::state(node)).right.is_null() {
                x = (*Self::state(node)).left;
                x_parent = (*Self::state(node)).parent;
                self.transplant(node, (*Self::state(node)).left);
            } else {
                y = (*Self::state(node)).right;
                while !(*Self::state(y)).left.is_null() {
                    y = (*Self::state(y)).left;
                }
                y_original_color = (*Self::state(y)).color;
                x = (*Self::state(y)).right;

                if (*Self::state(y)).parent == node {
                    x_parent = y;
                    if !x.is_null() {
                        (*Self::state(x)).parent = y;
                    }
                } else {
                    x_parent = (*Self::state(y)).parent;
                    self.transplant(y, (*Self::state(y)).right);
                    (*Self::state(y)).right = (*Self::state(node)).right;
                    (*Self::state((*Self::state(y)).right)).parent = y;
                }

                self.transplant(node, y);
                (*Self::state(y)).left = (*Self::state(node)).left;
                (*Self::state((*Self::state(y)).left)).parent = y;
                (*Self::state(y)).color = (*Self::state(node)).color;
            }

            if y_original_color == Color::Black {
                self.delete_fixup(x, x_parent);
            }

            *Self::state(node) = RbState::new();
        }
    }

    unsafe fn transplant(&mut self, u: *mut N, v: *mut N) {
        unsafe {
            let parent = (*Self::state(u)).parent;
            if parent.is_null() {
                self.root = v;
            } else if u == (*Self::state(parent)).left {
                (*Self::state(parent)).left = v;
            } else {
                (*Self::state(parent)).right = v;
            }
            if !v.is_null() {
                (*Self::state(v)).parent = parent;
            }
        }
    }

    unsafe fn delete_fixup(&mut self, mut x: *mut N, mut x_parent: *mut N) {
        unsafe {
            while x != self.root && (x.is_null() || (*Self::state(x)).color == Color::Black) {
                if x_parent.is_null() {
                    break;
                }
                if x == (*Self::state(x_parent)).left {
                    let mut w = (*Self::state(x_parent)).right;
                    if !w.is_null() && (*Self::state(w)).color == Color::Red {
                        (*Self::state(w)).color = Color::Black;
                        (*Self::state(x_parent)).color = Color::Red;
                        self.rotate_left(x_parent);
                        w = (*Self::state(x_parent)).right;
                    }
                    if w.is_null() {
                        x = x_parent;
                        x_parent = (*Self::state(x)).parent;
                        continue;
                    }
                    let left_black =
                        (*Self::state(w)).left.is_null() || (*Self::state((*Self::state(w)).left)).color == Color::Black;
                    let right_black =
                        (*Self::state(w)).right.is_null() || (*Self::state((*Self::state(w)).right)).color == Color::Black;
                    if left_black && right_black {
                        (*Self::state(w)).color = Color::Red;
                        x = x_parent;
                        x_parent = (*Self::state(x)).parent;
                    } else {
                        if right_black {
                            if !(*Self::state(w)).left.is_null() {
                                (*Self::state((*Self::state(w)).left)).color = Color::Black;
                            }
                            (*Self::state(w)).color = Color::Red;
                            self.rotate_right(w);
                            w = (*Self::state(x_parent)).right;
                        }
                        if !w.is_null() {
                            (*Self::state(w)).color = (*Self::state(x_parent)).color;
                            (*Self::state(x_parent)).color = Color::Black;
                            if !(*Self::state(w)).right.is_null() {
                                (*Self::state((*Self::state(w)).right)).color = Color::Black;
                            }
                            self.rotate_left(x_parent);
                        }
                        x = self.root;
                        break;
                    }
                } else {
                    let mut w = (*Self::state(x_parent)).left;
                    if !w.is_null() && (*Self::state(w)).color == Color::Red {
                        (*Self::state(w)).color = Color::Black;
                        (*Self::state(x_parent)).color = Color::Red;
                        self.rotate_right(x_parent);
                        w = (*Self::state(x_parent)).left;
                    }
                    if w.is_null() {
                        x = x_parent;
                        x_parent = (*Self::state(x)).parent;
                        continue;
                    }
                    let left_black =
                        (*Self::state(w)).left.is_null() || (*Self::state((*Self::state(w)).left)).color == Color::Black;
                    let right_black =
                        (*Self::state(w)).right.is_null() || (*Self::state((*Self::state(w)).right)).color == Color::Black;
                    if left_black && right_black {
                        (*Self::state(w)).color = Color::Red;
                        x = x_parent;
                        x_parent = (*Self::state(x)).parent;
                    } else {
                        if left_black {
                            if !(*Self::state(w)).right.is_null() {
                                (*Self::state((*Self::state(w)).right)).color = Color::Black;
                            }
                            (*Self::state(w)).color = Color::Red;
                            self.rotate_left(w);
                            w = (*Self::state(x_parent)).left;
                        }
                        if !w.is_null() {
                            (*Self::state(w)).color = (*Self::state(x_parent)).color;
                            (*Self::state(x_parent)).color = Color::Black;
                            if !(*Self::state(w)).left.is_null() {
                                (*Self::state((*Self::state(w)).left)).color = Color::Black;
                            }
                            self.rotate_right(x_parent);
                        }
                        x = self.root;
                        break;
                    }
                }
            }
            if !x.is_null() {
                (*Self::state(x)).color = Color::Black;
            }
        }
    }
}

// SAFETY: the tree itself holds no data; it is Send/Sync exactly when its
// nodes are, which callers establish by construction (each node lives in
// memory with the same thread-safety story as the pool that owns it).
unsafe impl<N: RbLink> Send for RbTree<N> {}
unsafe impl<N: RbLink> Sync for RbTree<N> {}

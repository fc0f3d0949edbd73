/// Things that occupy a variable number of slots (stack slots, local variables, constant pool
/// entries)
pub trait Width {
    fn width(&self) -> usize;
}

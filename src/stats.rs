//! Counters printed when -stat is supplied.

#[derive(Default)]
pub(crate) struct Stats {
    pub(crate) objects: usize,
    pub(crate) shared_objects: usize,
    pub(crate) input_sections: usize,
    pub(crate) defined_syms: usize,
    pub(crate) undefined_syms: usize,
    pub(crate) merged_pieces: usize,
    pub(crate) output_chunks: usize,
}

impl Stats {
    pub(crate) fn print(&self) {
        println!("num_objs={}", self.objects);
        println!("num_dsos={}", self.shared_objects);
        println!("input_sections={}", self.input_sections);
        println!("defined_syms={}", self.defined_syms);
        println!("undefined_syms={}", self.undefined_syms);
        println!("merged_strings={}", self.merged_pieces);
        println!("output_chunks={}", self.output_chunks);
    }
}

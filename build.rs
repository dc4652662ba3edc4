use cfg_aliases::cfg_aliases;

fn main() {
    // Setup cfg aliases
    cfg_aliases! {
        wasm: { target_arch = "wasm32" }
    }
}

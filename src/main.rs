fn main() {
    flai_lib::run();
}

#[rocket::launch]
fn rocket() -> _ {
    mailrag::rocket()
}
